use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use op_sinkhole::probe;

use super::DnsProber;

/// Queries the sinkhole listening on 127.0.0.1:53.
#[derive(Debug, Clone)]
pub struct LocalDnsProber {
    server: SocketAddr,
    timeout: Duration,
}

impl LocalDnsProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 53)),
            timeout,
        }
    }
}

#[async_trait]
impl DnsProber for LocalDnsProber {
    async fn resolves(&self, name: &str) -> Result<bool> {
        let answer = probe::query(self.server, name, self.timeout).await?;
        Ok(answer.resolved())
    }
}
