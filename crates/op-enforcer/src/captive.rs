//! Captive portal detection and temporary suspension of the firewall.
//!
//! While a portal session is in progress the DNS sinkhole stays as is; only the
//! firewall is lifted so the portal's authentication flow can reach its own
//! resolver. The engine reads `captive_portal_active` and leaves the firewall
//! alone until the coordinator restores it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::redirect::Policy as RedirectPolicy;
use tracing::{debug, info, warn};

use crate::enforcer::Enforcer;

/// Poll interval while a portal session is in progress.
const ACTIVE_POLL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PortalProbe: Send + Sync {
    /// `Ok(true)` when the detection endpoint was intercepted.
    async fn behind_portal(&self) -> Result<bool>;
}

/// Plain HTTP probe of a detection endpoint with a fixed expected body.
pub struct HttpPortalProbe {
    client: reqwest::Client,
    url: String,
    expected: String,
}

impl HttpPortalProbe {
    pub fn new(url: &str, expected: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(RedirectPolicy::none())
            .build()
            .context("Failed to build portal probe client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            expected: expected.trim().to_string(),
        })
    }
}

#[async_trait]
impl PortalProbe for HttpPortalProbe {
    async fn behind_portal(&self) -> Result<bool> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Portal probe {} failed", self.url))?;

        // Portals answer with a redirect to their login page.
        if response.status().is_redirection() {
            return Ok(true);
        }
        let body = response.text().await.context("Portal probe body")?;
        Ok(body.trim() != self.expected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptiveOutcome {
    Steady,
    /// A transition was due but the lock was busy.
    Skipped,
    Suspended,
    Restored,
}

pub struct CaptivePortalCoordinator {
    probe: Arc<dyn PortalProbe>,
    enforcer: Arc<Enforcer>,
}

impl CaptivePortalCoordinator {
    pub fn new(probe: Arc<dyn PortalProbe>, enforcer: Arc<Enforcer>) -> Self {
        Self { probe, enforcer }
    }

    pub async fn tick(&self) -> CaptiveOutcome {
        let behind = match self.probe.behind_portal().await {
            Ok(behind) => behind,
            Err(e) => {
                // No network at all is not a portal.
                debug!("Portal probe inconclusive: {:#}", e);
                return CaptiveOutcome::Steady;
            }
        };

        let active = self.enforcer.store().load().captive_portal_active;
        match (behind, active) {
            (true, false) => self.suspend().await,
            (false, true) => self.restore().await,
            _ => CaptiveOutcome::Steady,
        }
    }

    async fn suspend(&self) -> CaptiveOutcome {
        let Some(guard) = self.acquire() else {
            return CaptiveOutcome::Skipped;
        };
        let mut state = self.enforcer.store().load();
        if state.captive_portal_active {
            return CaptiveOutcome::Steady;
        }

        if let Err(e) = self.enforcer.system().firewall.flush().await {
            warn!("Captive portal: firewall flush failed: {:#}", e);
            return CaptiveOutcome::Steady;
        }
        state.captive_portal_active = true;
        if let Err(e) = self.enforcer.save(&guard, &state) {
            warn!("Cannot persist captive portal state: {}", e);
        }
        warn!("Captive portal detected, firewall suspended until authentication");
        CaptiveOutcome::Suspended
    }

    async fn restore(&self) -> CaptiveOutcome {
        let Some(guard) = self.acquire() else {
            return CaptiveOutcome::Skipped;
        };
        let mut state = self.enforcer.store().load();
        if !state.captive_portal_active {
            return CaptiveOutcome::Steady;
        }

        if state.enforcement_enabled {
            if let Err(e) = self
                .enforcer
                .system()
                .firewall
                .apply(self.enforcer.upstream())
                .await
            {
                warn!("Captive portal: firewall restore failed, retrying: {:#}", e);
                return CaptiveOutcome::Steady;
            }
        }
        state.captive_portal_active = false;
        if let Err(e) = self.enforcer.save(&guard, &state) {
            warn!("Cannot persist captive portal state: {}", e);
        }
        info!(
            enforcing = state.enforcement_enabled,
            "Captive portal authenticated, enforcement restored"
        );
        CaptiveOutcome::Restored
    }

    fn acquire(&self) -> Option<op_common::LockGuard> {
        match self.enforcer.try_lock("captive-portal") {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!("Enforcement lock busy, captive portal transition deferred");
                None
            }
            Err(e) => {
                warn!("Cannot take enforcement lock: {}", e);
                None
            }
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) -> anyhow::Result<()> {
        loop {
            self.tick().await;
            let active = self.enforcer.store().load().captive_portal_active;
            tokio::time::sleep(if active { ACTIVE_POLL } else { period }).await;
        }
    }
}
