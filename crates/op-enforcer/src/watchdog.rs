//! Periodic health probe of the resolver and the DNS path.
//!
//! A run is failed when at least one check stays broken after its recovery
//! action. Consecutive failed runs accumulate in the persisted state; reaching
//! the threshold while enforcing forces fail-open.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use op_common::{FailOpenReason, LockGuard, ReconciliationState};
use op_sinkhole::dnsmasq;
use op_whitelist::{Policy, source};
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::enforcer::Enforcer;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    /// Broken at first, fixed by the recovery action.
    pub recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str) -> Self {
        Self {
            name,
            ok: true,
            recovered: false,
            detail: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            recovered: false,
            detail: Some(detail.into()),
        }
    }

    fn skipped(name: &'static str, why: &str) -> Self {
        Self {
            name,
            ok: true,
            recovered: false,
            detail: Some(format!("skipped: {why}")),
        }
    }

    fn recovered(name: &'static str, action: &str) -> Self {
        Self {
            name,
            ok: true,
            recovered: true,
            detail: Some(action.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Lock held by another task.
    Skipped,
    Healthy,
    Degraded { failures: u32 },
    FailedOpen,
}

pub struct HealthWatchdog {
    enforcer: Arc<Enforcer>,
}

impl HealthWatchdog {
    pub fn new(enforcer: Arc<Enforcer>) -> Self {
        Self { enforcer }
    }

    /// One watchdog run: checks with recovery, failure accounting, and
    /// fail-open once the threshold is reached.
    pub async fn run_once(&self) -> WatchdogOutcome {
        let guard = match self.enforcer.try_lock("watchdog") {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Enforcement lock busy, skipping health check");
                return WatchdogOutcome::Skipped;
            }
            Err(e) => {
                warn!("Cannot take enforcement lock: {}", e);
                return WatchdogOutcome::Skipped;
            }
        };

        let mut state = self.enforcer.store().load();
        let checks = self.checks(&state, Some(&guard)).await;
        state.last_health_check_at = Some(Utc::now());

        let unresolved: Vec<&str> = checks.iter().filter(|c| !c.ok).map(|c| c.name).collect();
        if unresolved.is_empty() {
            if state.consecutive_failure_count > 0 {
                info!(
                    previous_failures = state.consecutive_failure_count,
                    "Health restored"
                );
            }
            state.consecutive_failure_count = 0;
            if let Err(e) = self.enforcer.save(&guard, &state) {
                warn!("Cannot persist health state: {}", e);
            }
            return WatchdogOutcome::Healthy;
        }

        state.consecutive_failure_count = state.consecutive_failure_count.saturating_add(1);
        let failures = state.consecutive_failure_count;
        warn!(failures, checks = ?unresolved, "Health check failed");

        let threshold = self.enforcer.config().failure_threshold;
        if state.enforcement_enabled && state.watchdog_tripped(threshold) {
            error!(failures, threshold, "Health failure threshold reached");
            if let Err(e) = self
                .enforcer
                .fail_open(&guard, &mut state, FailOpenReason::HealthWatchdog)
                .await
            {
                error!("Fail-open could not persist state: {}", e);
            }
            return WatchdogOutcome::FailedOpen;
        }

        if let Err(e) = self.enforcer.save(&guard, &state) {
            warn!("Cannot persist health state: {}", e);
        }
        WatchdogOutcome::Degraded { failures }
    }

    /// Read-only run for `status`: no recovery, no state change.
    pub async fn inspect(&self) -> Vec<CheckResult> {
        let state = self.enforcer.store().load();
        self.checks(&state, None).await
    }

    async fn checks(
        &self,
        state: &ReconciliationState,
        recover: Option<&LockGuard>,
    ) -> Vec<CheckResult> {
        let mut results = vec![
            self.check_resolver_running(recover.is_some()).await,
            self.check_known_good_resolves(recover.is_some()).await,
        ];
        if state.enforcement_enabled && !state.captive_portal_active {
            results.push(self.check_sinkhole().await);
            results.push(self.check_firewall(recover.is_some()).await);
        }
        results.push(self.check_host_resolver(recover.is_some()).await);
        results
    }

    async fn recheck_delay(&self) {
        let secs = self.enforcer.config().recheck_delay_secs;
        if secs > 0 {
            sleep(Duration::from_secs(secs)).await;
        }
    }

    async fn check_resolver_running(&self, recover: bool) -> CheckResult {
        const NAME: &str = "resolver-running";
        let resolver = &self.enforcer.system().resolver;
        if resolver.is_running().await {
            return CheckResult::pass(NAME);
        }
        if !recover {
            return CheckResult::fail(NAME, "resolver service is not running");
        }

        warn!("Resolver not running, restarting");
        if let Err(e) = resolver.restart().await {
            return CheckResult::fail(NAME, format!("restart failed: {e:#}"));
        }
        self.recheck_delay().await;
        if resolver.is_running().await {
            CheckResult::recovered(NAME, "resolver restarted")
        } else {
            CheckResult::fail(NAME, "still not running after restart")
        }
    }

    async fn check_known_good_resolves(&self, recover: bool) -> CheckResult {
        const NAME: &str = "known-good-resolves";
        let domain = &self.enforcer.config().health_domain;
        let system = self.enforcer.system();

        let first = system.prober.resolves(domain).await;
        if matches!(first, Ok(true)) {
            return CheckResult::pass(NAME);
        }
        let detail = match first {
            Ok(_) => format!("{domain} did not resolve"),
            Err(e) => format!("{domain}: {e:#}"),
        };
        if !recover {
            return CheckResult::fail(NAME, detail);
        }

        warn!(domain = %domain, "Known-good domain does not resolve, restarting resolver");
        if let Err(e) = system.resolver.restart().await {
            return CheckResult::fail(NAME, format!("{detail}; restart failed: {e:#}"));
        }
        self.recheck_delay().await;
        match system.prober.resolves(domain).await {
            Ok(true) => CheckResult::recovered(NAME, "resolver restarted"),
            _ => CheckResult::fail(NAME, format!("{detail} (after restart)")),
        }
    }

    /// Integrity failure, never auto-fixed: the sinkhole answers a name it
    /// should not.
    async fn check_sinkhole(&self) -> CheckResult {
        const NAME: &str = "sinkhole-blocks";
        let config = self.enforcer.config();
        let domain = &config.sinkhole_probe_domain;

        if let Some(Policy::Active(rules)) = source::load_cache(&config.whitelist_cache_path()) {
            if rules.allows(domain) {
                return CheckResult::skipped(NAME, "probe domain is allowed by the whitelist");
            }
        }

        match self.enforcer.system().prober.resolves(domain).await {
            Ok(false) => CheckResult::pass(NAME),
            Ok(true) => {
                let on_disk = op_common::fs::read_optional(&config.dnsmasq_config_path)
                    .ok()
                    .flatten();
                let cause = match on_disk {
                    Some(text) if !dnsmasq::verify_deny_all_first(&text) => {
                        "deny-all rule missing or not first"
                    }
                    Some(_) => "deny-all rule present but not honoured",
                    None => "sinkhole configuration missing",
                };
                error!(domain = %domain, cause, "Sinkhole integrity failure");
                CheckResult::fail(NAME, format!("{domain} resolved: {cause}"))
            }
            Err(e) => CheckResult::fail(NAME, format!("{domain}: {e:#}")),
        }
    }

    async fn check_firewall(&self, recover: bool) -> CheckResult {
        const NAME: &str = "firewall-active";
        let firewall = &self.enforcer.system().firewall;
        if firewall.is_active().await {
            return CheckResult::pass(NAME);
        }
        if !recover {
            return CheckResult::fail(NAME, "enforcement rules missing");
        }

        warn!("Firewall rules missing, re-applying");
        if let Err(e) = firewall.apply(self.enforcer.upstream()).await {
            return CheckResult::fail(NAME, format!("re-apply failed: {e:#}"));
        }
        if firewall.is_active().await {
            CheckResult::recovered(NAME, "rules re-applied")
        } else {
            CheckResult::fail(NAME, "rules still missing after re-apply")
        }
    }

    async fn check_host_resolver(&self, recover: bool) -> CheckResult {
        const NAME: &str = "host-resolver-local";
        let host_dns = &self.enforcer.system().host_dns;
        if host_dns.points_to_local().await {
            return CheckResult::pass(NAME);
        }
        if !recover {
            return CheckResult::fail(NAME, "host resolver does not point at 127.0.0.1");
        }

        warn!("Host resolver no longer points at the sinkhole, resetting");
        if let Err(e) = host_dns.reset().await {
            return CheckResult::fail(NAME, format!("reset failed: {e:#}"));
        }
        if host_dns.points_to_local().await {
            CheckResult::recovered(NAME, "resolver configuration reset")
        } else {
            CheckResult::fail(NAME, "still not local after reset")
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = self.run_once().await;
            debug!(?outcome, "Health check finished");
        }
    }
}
