//! OS collaborators. The enforcement logic only sees these traits; production
//! implementations shell out to systemctl, iptables and pkill.

pub mod browsers;
pub mod firewall;
pub mod host_dns;
pub mod prober;
pub mod resolver;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use op_common::EnvConfig;
use op_sinkhole::UpstreamDns;

pub use browsers::ProcessBrowsers;
pub use firewall::IptablesFirewall;
pub use host_dns::ResolvConf;
pub use prober::LocalDnsProber;
pub use resolver::SystemdResolver;

/// The sinkhole resolver daemon.
#[async_trait]
pub trait ResolverService: Send + Sync {
    async fn is_running(&self) -> bool;
    async fn restart(&self) -> Result<()>;
    /// Make the daemon pick up a rewritten config file.
    async fn reload(&self) -> Result<()>;
}

/// DNS egress restrictions.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn apply(&self, upstream: &UpstreamDns) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn is_active(&self) -> bool;
}

#[async_trait]
pub trait BrowserControl: Send + Sync {
    /// Close running browsers so they reload managed policies.
    async fn close_all(&self) -> Result<()>;
}

/// The machine's own resolver configuration (resolv.conf).
#[async_trait]
pub trait HostResolverConfig: Send + Sync {
    async fn points_to_local(&self) -> bool;
    async fn reset(&self) -> Result<()>;
}

/// Lookups through the local sinkhole.
#[async_trait]
pub trait DnsProber: Send + Sync {
    /// `Ok(true)` when the name resolves to at least one address.
    async fn resolves(&self, name: &str) -> Result<bool>;
}

/// Handles to every collaborator, cheap to clone across tasks.
#[derive(Clone)]
pub struct SystemHandles {
    pub resolver: Arc<dyn ResolverService>,
    pub firewall: Arc<dyn Firewall>,
    pub browsers: Arc<dyn BrowserControl>,
    pub host_dns: Arc<dyn HostResolverConfig>,
    pub prober: Arc<dyn DnsProber>,
}

impl SystemHandles {
    /// Production collaborators for this host.
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            resolver: Arc::new(SystemdResolver::new(&config.resolver_unit)),
            firewall: Arc::new(IptablesFirewall::new()),
            browsers: Arc::new(ProcessBrowsers::default()),
            host_dns: Arc::new(ResolvConf::new(&config.resolv_conf_path)),
            prober: Arc::new(LocalDnsProber::new(config.probe_timeout())),
        }
    }
}
