//! systemd management of the sinkhole resolver unit.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::ResolverService;

/// Timeout for systemctl operations.
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SystemdResolver {
    unit: String,
}

impl SystemdResolver {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
        }
    }

    async fn systemctl(&self, action: &str) -> Result<()> {
        let result = timeout(
            SYSTEMCTL_TIMEOUT,
            Command::new("systemctl")
                .args([action, &self.unit])
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                debug!(unit = %self.unit, action, "systemctl ok");
                Ok(())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!("Failed to {} {}: {}", action, self.unit, stderr.trim()))
            }
            Ok(Err(e)) => Err(anyhow!("Failed to execute systemctl: {}", e)),
            Err(_) => Err(anyhow!("Timeout during {} of {}", action, self.unit)),
        }
    }
}

#[async_trait]
impl ResolverService for SystemdResolver {
    async fn is_running(&self) -> bool {
        let output = Command::new("systemctl")
            .args(["is-active", &self.unit])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).trim() == "active",
            Err(_) => false,
        }
    }

    async fn restart(&self) -> Result<()> {
        self.systemctl("restart").await
    }

    /// dnsmasq only re-reads hosts files on SIGHUP, not its config: restart.
    async fn reload(&self) -> Result<()> {
        self.systemctl("restart").await
    }
}
