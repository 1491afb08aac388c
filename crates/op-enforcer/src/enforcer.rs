//! Lock-guarded mutations of the enforcement configuration.
//!
//! The reconciliation engine, the health watchdog and the captive portal
//! coordinator all go through an [`Enforcer`]. Every method that touches the
//! sinkhole, the browser policies or the firewall takes a [`LockGuard`], so
//! nothing can write configuration without holding the shared lock.

use std::sync::Arc;

use op_common::{
    EnforceError, EnforcementLock, EnvConfig, FailOpenReason, LockGuard, ReconciliationState,
    Result, StateStore,
};
use op_sinkhole::{RenderedArtifacts, UpstreamDns, browser, dnsmasq};
use op_whitelist::Rules;
use tracing::{debug, error, info, warn};

use crate::system::SystemHandles;

pub struct Enforcer {
    config: Arc<EnvConfig>,
    upstream: UpstreamDns,
    system: SystemHandles,
    lock: EnforcementLock,
    store: StateStore,
}

impl Enforcer {
    pub fn new(config: Arc<EnvConfig>, upstream: UpstreamDns, system: SystemHandles) -> Self {
        let lock = EnforcementLock::new(config.lock_path());
        let store = StateStore::new(config.state_path());
        Self {
            config,
            upstream,
            system,
            lock,
            store,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn upstream(&self) -> &UpstreamDns {
        &self.upstream
    }

    pub fn system(&self) -> &SystemHandles {
        &self.system
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn lock(&self) -> &EnforcementLock {
        &self.lock
    }

    /// Non-blocking acquisition. `Ok(None)` means another task holds the lock.
    pub fn try_lock(&self, holder: &'static str) -> Result<Option<LockGuard>> {
        Ok(self.lock.try_acquire(holder)?)
    }

    pub fn essential_domains(&self) -> Vec<String> {
        self.config.essential_domains()
    }

    pub fn render(&self, rules: &Rules) -> RenderedArtifacts {
        op_sinkhole::render(rules, &self.upstream, &self.essential_domains())
    }

    pub fn write_dns(&self, _guard: &LockGuard, config: &str) -> Result<()> {
        let path = &self.config.dnsmasq_config_path;
        op_common::fs::write_atomic(path, config.as_bytes())
            .map_err(|e| EnforceError::write(path, e))?;
        debug!(path = %path.display(), "Sinkhole configuration written");
        Ok(())
    }

    /// Merge the rendered block lists into every browser policy document, or
    /// remove them when `artifacts` is `None`.
    pub fn write_browser(
        &self,
        _guard: &LockGuard,
        artifacts: Option<&RenderedArtifacts>,
    ) -> Result<()> {
        browser::merge_firefox(
            &self.config.firefox_policy_path,
            artifacts.map(|a| &a.firefox_policy),
        )?;
        for path in &self.config.chromium_policy_paths {
            browser::merge_chromium(path, artifacts.map(|a| &a.chromium_policy))?;
        }
        debug!(cleared = artifacts.is_none(), "Browser policies written");
        Ok(())
    }

    pub fn save(&self, _guard: &LockGuard, state: &ReconciliationState) -> Result<()> {
        self.store.save(state)
    }

    /// Drop every restriction: firewall flushed, resolver in passthrough,
    /// browser block lists removed, browsers closed.
    ///
    /// Each step is attempted even when an earlier one failed. The state is
    /// persisted with both hashes cleared so the next active policy is
    /// re-applied in full.
    pub async fn fail_open(
        &self,
        guard: &LockGuard,
        state: &mut ReconciliationState,
        reason: FailOpenReason,
    ) -> Result<()> {
        error!(%reason, "Entering fail-open, enforcement disabled");

        if let Err(e) = self.system.firewall.flush().await {
            warn!("Fail-open: firewall flush failed: {:#}", e);
        }

        match self.write_dns(guard, &dnsmasq::render_passthrough(&self.upstream)) {
            Ok(()) => {
                if let Err(e) = self.system.resolver.reload().await {
                    warn!("Fail-open: resolver reload failed: {:#}", e);
                }
            }
            Err(e) => warn!("Fail-open: {}", e),
        }

        if let Err(e) = self.write_browser(guard, None) {
            warn!("Fail-open: {}", e);
        }

        if let Err(e) = self.system.browsers.close_all().await {
            warn!("Fail-open: closing browsers failed: {:#}", e);
        }

        state.enforcement_enabled = false;
        state.dns_config_hash = None;
        state.browser_policy_hash = None;
        state.fail_open_reason = Some(reason);
        self.save(guard, state)?;

        info!(%reason, "Fail-open complete");
        Ok(())
    }
}
