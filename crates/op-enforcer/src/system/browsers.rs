use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::BrowserControl;

/// Closes browsers by process name so the next launch reads fresh policies.
#[derive(Debug, Clone)]
pub struct ProcessBrowsers {
    process_names: Vec<String>,
}

impl Default for ProcessBrowsers {
    fn default() -> Self {
        Self {
            process_names: [
                "firefox",
                "firefox-esr",
                "firefox-bin",
                "chromium",
                "chromium-browser",
                "chrome",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[async_trait]
impl BrowserControl for ProcessBrowsers {
    async fn close_all(&self) -> Result<()> {
        let mut closed = Vec::new();
        for name in &self.process_names {
            let result = Command::new("pkill")
                .args(["-TERM", "-x", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            match result {
                Ok(status) if status.success() => closed.push(name.as_str()),
                Ok(_) => {
                    // pkill exits 1 when nothing matched
                    debug!(process = %name, "No running process");
                }
                Err(e) => warn!(process = %name, "Failed to run pkill: {}", e),
            }
        }

        if !closed.is_empty() {
            info!(browsers = ?closed, "Browsers closed to reload policies");
        }
        Ok(())
    }
}
