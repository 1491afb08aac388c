//! Fetch → diff → write → apply, one cycle at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use op_common::{EnforceError, FailOpenReason, LockGuard, ReconciliationState, Result};
use op_sinkhole::{RenderedArtifacts, digest};
use op_whitelist::{FetchError, Policy, PolicySource, source};
use tokio::sync::{Notify, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::enforcer::Enforcer;

/// Phase of the engine, observable through [`ReconciliationEngine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Fetching,
    Diffing,
    Applying,
    EmergencyDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Apply only what changed since the last persisted state.
    Normal,
    /// Re-apply everything, falling back to the cached policy when the
    /// source is unreachable.
    Force,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Lock held by another task.
    Skipped,
    /// Source unreachable, previous configuration left in place.
    Unreachable,
    /// Document rejected by the parser, previous configuration left in place.
    Rejected,
    Unchanged,
    /// The watchdog tripped; enforcement stays off until it sees a clean run.
    HeldFailOpen,
    EmergencyDisabled,
    Applied {
        dns_changed: bool,
        browser_changed: bool,
        browsers_closed: bool,
    },
    Failed(EnforceError),
}

/// What a cycle decided to touch.
#[derive(Debug, Clone, Copy)]
struct Plan {
    dns: bool,
    browser: bool,
}

pub struct ReconciliationEngine {
    source: Arc<dyn PolicySource>,
    enforcer: Arc<Enforcer>,
    phase: watch::Sender<EngineState>,
}

impl ReconciliationEngine {
    pub fn new(source: Arc<dyn PolicySource>, enforcer: Arc<Enforcer>) -> Self {
        let (phase, _) = watch::channel(EngineState::Idle);
        Self {
            source,
            enforcer,
            phase,
        }
    }

    pub fn phase(&self) -> EngineState {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: EngineState) {
        self.phase.send_replace(phase);
    }

    /// Run one reconciliation cycle. Never blocks on the lock.
    pub async fn run_cycle(&self, mode: CycleMode) -> CycleOutcome {
        let guard = match self.enforcer.try_lock("reconcile") {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Enforcement lock busy, skipping reconciliation cycle");
                return CycleOutcome::Skipped;
            }
            Err(e) => return CycleOutcome::Failed(e),
        };

        let outcome = self.cycle(&guard, mode).await;
        self.enter(EngineState::Idle);
        outcome
    }

    async fn cycle(&self, guard: &LockGuard, mode: CycleMode) -> CycleOutcome {
        self.enter(EngineState::Fetching);
        let cache_path = self.enforcer.config().whitelist_cache_path();
        let policy = match self.source.fetch().await {
            Ok(policy) => {
                if let Err(e) = source::save_cache(&policy, &cache_path) {
                    warn!(path = %cache_path.display(), "Cannot cache whitelist: {}", e);
                }
                policy
            }
            Err(FetchError::Unreachable(reason)) => {
                let err = EnforceError::FetchUnreachable(reason);
                warn!("{}, keeping last applied configuration", err);
                match (mode, source::load_cache(&cache_path)) {
                    (CycleMode::Force, Some(cached)) => {
                        info!("Force apply falls back to the cached whitelist");
                        cached
                    }
                    _ => return CycleOutcome::Unreachable,
                }
            }
            Err(FetchError::Parse(e)) => {
                let err = EnforceError::Parse(e.to_string());
                error!("{}, keeping previous policy", err);
                return CycleOutcome::Rejected;
            }
        };

        let mut state = self.enforcer.store().load();

        let rules = match policy {
            Policy::Disabled => return self.emergency_disable(guard, &mut state, mode).await,
            Policy::Active(rules) => rules,
        };

        let threshold = self.enforcer.config().failure_threshold;
        if state.watchdog_tripped(threshold) {
            if mode == CycleMode::Normal {
                warn!(
                    failures = state.consecutive_failure_count,
                    "Health watchdog holds fail-open, not re-enabling enforcement"
                );
                return CycleOutcome::HeldFailOpen;
            }
            info!("Force apply overrides the health watchdog fail-open");
            state.consecutive_failure_count = 0;
        }

        self.enter(EngineState::Diffing);
        let artifacts = self.enforcer.render(&rules);
        let dns_digest = artifacts.dns_digest();
        let browser_digest = artifacts.browser_digest();
        let dns_changed = digest::changed(state.dns_config_hash.as_deref(), &dns_digest);
        let browser_changed =
            digest::changed(state.browser_policy_hash.as_deref(), &browser_digest);
        let enabling = !state.enforcement_enabled;

        if mode == CycleMode::Normal && !dns_changed && !browser_changed && !enabling {
            debug!("Policy unchanged");
            return CycleOutcome::Unchanged;
        }

        self.enter(EngineState::Applying);
        let plan = match mode {
            CycleMode::Force => Plan {
                dns: true,
                browser: true,
            },
            CycleMode::Normal => Plan {
                dns: dns_changed,
                browser: browser_changed,
            },
        };

        let was_enabled = state.enforcement_enabled;
        let mut browser_written = false;
        let applied = self
            .apply(guard, &mut state, &artifacts, plan, &mut browser_written)
            .await;

        // Closure follows what actually landed, even if a later step failed.
        // A forced rewrite of identical browser policies does not count.
        let became_enabled = !was_enabled && state.enforcement_enabled;
        let mut browsers_closed = false;
        if (browser_written && browser_changed) || became_enabled {
            match self.enforcer.system().browsers.close_all().await {
                Ok(()) => browsers_closed = true,
                Err(e) => warn!("Closing browsers failed: {:#}", e),
            }
        }

        if applied.is_ok() {
            state.last_applied_at = Some(Utc::now());
        }
        let saved = self.enforcer.save(guard, &state);

        match applied.and(saved) {
            Ok(()) => {
                info!(
                    dns_changed,
                    browser_changed,
                    browsers_closed,
                    forced = mode == CycleMode::Force,
                    domains = rules.domains.len(),
                    "Policy applied"
                );
                CycleOutcome::Applied {
                    dns_changed,
                    browser_changed,
                    browsers_closed,
                }
            }
            Err(e) => {
                error!("Reconciliation failed, retrying next cycle: {}", e);
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Each step records its hash only once it has succeeded, so a failure
    /// leaves the remaining steps pending for the next cycle.
    async fn apply(
        &self,
        guard: &LockGuard,
        state: &mut ReconciliationState,
        artifacts: &RenderedArtifacts,
        plan: Plan,
        browser_written: &mut bool,
    ) -> Result<()> {
        let system = self.enforcer.system();

        if plan.browser {
            self.enforcer.write_browser(guard, Some(artifacts))?;
            state.browser_policy_hash = Some(artifacts.browser_digest().into());
            *browser_written = true;
        }

        if plan.dns {
            self.enforcer.write_dns(guard, &artifacts.dns_config)?;
            system
                .resolver
                .reload()
                .await
                .map_err(|e| EnforceError::apply("resolver reload", format!("{e:#}")))?;
            state.dns_config_hash = Some(artifacts.dns_digest().into());
        }

        if state.captive_portal_active {
            info!("Captive portal session in progress, firewall left to the coordinator");
        } else {
            system
                .firewall
                .apply(self.enforcer.upstream())
                .await
                .map_err(|e| EnforceError::apply("firewall", format!("{e:#}")))?;
        }

        state.enforcement_enabled = true;
        state.fail_open_reason = None;
        Ok(())
    }

    async fn emergency_disable(
        &self,
        guard: &LockGuard,
        state: &mut ReconciliationState,
        mode: CycleMode,
    ) -> CycleOutcome {
        let already = !state.enforcement_enabled
            && state.fail_open_reason == Some(FailOpenReason::DisableMarker);
        if already && mode == CycleMode::Normal {
            debug!("Whitelist still disabled, enforcement already off");
            return CycleOutcome::Unchanged;
        }

        self.enter(EngineState::EmergencyDisable);
        match self
            .enforcer
            .fail_open(guard, state, FailOpenReason::DisableMarker)
            .await
        {
            Ok(()) => CycleOutcome::EmergencyDisabled,
            Err(e) => {
                error!("Emergency disable could not persist state: {}", e);
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Periodic loop. `trigger` wakes it early (SIGHUP, operator request).
    pub async fn run(self: Arc<Self>, period: Duration, trigger: Arc<Notify>) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => {
                    info!("Reconciliation triggered");
                    ticker.reset();
                }
            }

            match self.run_cycle(CycleMode::Normal).await {
                CycleOutcome::Failed(e) => warn!("Cycle failed: {}", e),
                outcome => debug!(?outcome, "Cycle finished"),
            }
        }
    }
}
