use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use op_common::fs::{read_optional, write_atomic};
use tracing::info;

use super::HostResolverConfig;

pub const LOCAL_NAMESERVER: &str = "127.0.0.1";

/// `/etc/resolv.conf` pointing the machine at the local sinkhole.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
}

impl ResolvConf {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

/// First `nameserver` line, if any.
pub fn first_nameserver(content: &str) -> Option<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with(';'))
        .find_map(|l| l.strip_prefix("nameserver"))
        .map(str::trim)
}

#[async_trait]
impl HostResolverConfig for ResolvConf {
    async fn points_to_local(&self) -> bool {
        match read_optional(&self.path) {
            Ok(Some(content)) => first_nameserver(&content) == Some(LOCAL_NAMESERVER),
            _ => false,
        }
    }

    async fn reset(&self) -> Result<()> {
        let content = format!(
            "# Managed by openpath: queries go through the local sinkhole\nnameserver {LOCAL_NAMESERVER}\noptions edns0 trust-ad\n"
        );
        // A symlink (systemd-resolved stub) is replaced by a regular file.
        write_atomic(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to rewrite {}", self.path.display()))?;
        info!(path = %self.path.display(), "Host resolver reset to local sinkhole");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_nameserver() {
        assert_eq!(first_nameserver("# x\nnameserver 127.0.0.1\nnameserver 8.8.8.8\n"), Some("127.0.0.1"));
        assert_eq!(first_nameserver("search lan\n"), None);
    }

    #[tokio::test]
    async fn test_reset_points_local() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();

        let conf = ResolvConf::new(&path);
        assert!(!conf.points_to_local().await);
        conf.reset().await.unwrap();
        assert!(conf.points_to_local().await);
    }
}
