use std::fmt;
use std::sync::Arc;

use op_common::ReconciliationState;
use op_whitelist::{Policy, source};
use serde::Serialize;

use crate::enforcer::Enforcer;
use crate::watchdog::{CheckResult, HealthWatchdog};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    pub disabled: bool,
    pub domains: usize,
    pub blocked_subdomains: usize,
    pub blocked_paths: usize,
}

impl From<&Policy> for PolicySummary {
    fn from(policy: &Policy) -> Self {
        match policy.rules() {
            Some(rules) => Self {
                disabled: false,
                domains: rules.domains.len(),
                blocked_subdomains: rules.blocked_subdomains.len(),
                blocked_paths: rules.blocked_paths.len(),
            },
            None => Self {
                disabled: true,
                domains: 0,
                blocked_subdomains: 0,
                blocked_paths: 0,
            },
        }
    }
}

/// Persisted state plus live health checks, for the `status` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: ReconciliationState,
    pub lock_holder: Option<String>,
    pub upstream: String,
    pub whitelist_url: Option<String>,
    pub cached_policy: Option<PolicySummary>,
    pub checks: Vec<CheckResult>,
}

impl StatusReport {
    pub async fn collect(enforcer: &Arc<Enforcer>) -> Self {
        let config = enforcer.config();
        let cached_policy =
            source::load_cache(&config.whitelist_cache_path()).map(|p| PolicySummary::from(&p));
        let checks = HealthWatchdog::new(Arc::clone(enforcer)).inspect().await;

        Self {
            state: enforcer.store().load(),
            lock_holder: enforcer.lock().holder(),
            upstream: enforcer.upstream().to_string(),
            whitelist_url: config.whitelist_url.clone(),
            cached_policy,
            checks,
        }
    }

    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

fn hash_prefix(hash: Option<&str>) -> &str {
    match hash {
        Some(h) => &h[..h.len().min(12)],
        None => "-",
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.state;
        let enforcement = if s.enforcement_enabled { "ENABLED" } else { "DISABLED" };
        writeln!(f, "Enforcement:      {enforcement}")?;
        if let Some(reason) = s.fail_open_reason {
            writeln!(f, "Fail-open reason: {reason}")?;
        }
        writeln!(f, "Captive portal:   {}", if s.captive_portal_active { "active" } else { "no" })?;
        writeln!(f, "Health failures:  {}", s.consecutive_failure_count)?;
        writeln!(f, "DNS config hash:  {}", hash_prefix(s.dns_config_hash.as_deref()))?;
        writeln!(f, "Browser hash:     {}", hash_prefix(s.browser_policy_hash.as_deref()))?;
        if let Some(at) = s.last_applied_at {
            writeln!(f, "Last applied:     {}", at.to_rfc3339())?;
        }
        if let Some(at) = s.last_health_check_at {
            writeln!(f, "Last health run:  {}", at.to_rfc3339())?;
        }
        writeln!(f, "Upstream DNS:     {}", self.upstream)?;
        writeln!(f, "Whitelist URL:    {}", self.whitelist_url.as_deref().unwrap_or("(not set)"))?;
        match &self.cached_policy {
            Some(p) if p.disabled => writeln!(f, "Cached policy:    disabled")?,
            Some(p) => writeln!(
                f,
                "Cached policy:    {} domains, {} blocked subdomains, {} blocked paths",
                p.domains, p.blocked_subdomains, p.blocked_paths
            )?,
            None => writeln!(f, "Cached policy:    none")?,
        }
        if let Some(holder) = &self.lock_holder {
            writeln!(f, "Lock held by:     {holder}")?;
        }
        writeln!(f, "Health checks:")?;
        for check in &self.checks {
            let mark = if check.ok { "ok" } else { "FAIL" };
            match &check.detail {
                Some(detail) => writeln!(f, "  [{mark:>4}] {} ({detail})", check.name)?,
                None => writeln!(f, "  [{mark:>4}] {}", check.name)?,
            }
        }
        Ok(())
    }
}
