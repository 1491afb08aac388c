use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EnforceError, Result};
use crate::fs::{read_optional, write_atomic};

/// Why enforcement was switched off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailOpenReason {
    /// The whitelist document carries the disable marker.
    DisableMarker,
    /// The health watchdog hit its consecutive failure threshold.
    HealthWatchdog,
}

impl std::fmt::Display for FailOpenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DisableMarker => f.write_str("disable-marker"),
            Self::HealthWatchdog => f.write_str("health-watchdog"),
        }
    }
}

/// Last-applied enforcement configuration, persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationState {
    #[serde(default)]
    pub dns_config_hash: Option<String>,
    #[serde(default)]
    pub browser_policy_hash: Option<String>,
    #[serde(default)]
    pub enforcement_enabled: bool,
    #[serde(default)]
    pub consecutive_failure_count: u32,
    #[serde(default)]
    pub captive_portal_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_open_reason: Option<FailOpenReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl ReconciliationState {
    /// True once the watchdog failure count has reached `threshold`.
    pub fn watchdog_tripped(&self, threshold: u32) -> bool {
        self.consecutive_failure_count >= threshold
    }
}

/// Load/save boundary for [`ReconciliationState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file → default state. A corrupt file is logged and treated the
    /// same way, so the next apply rewrites everything.
    pub fn load(&self) -> ReconciliationState {
        match read_optional(&self.path) {
            Ok(Some(content)) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %self.path.display(), "Corrupt state file, starting fresh: {}", e);
                    ReconciliationState::default()
                }
            },
            Ok(None) => ReconciliationState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), "Cannot read state file: {}", e);
                ReconciliationState::default()
            }
        }
    }

    pub fn save(&self, state: &ReconciliationState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, content.as_bytes())
            .map_err(|e| EnforceError::write(&self.path, e))
    }
}
