#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use op_common::{EnvConfig, ReconciliationState};
use op_enforcer::system::{
    BrowserControl, DnsProber, Firewall, HostResolverConfig, ResolverService, SystemHandles,
};
use op_enforcer::{
    CaptivePortalCoordinator, Enforcer, HealthWatchdog, PortalProbe, ReconciliationEngine,
};
use op_sinkhole::UpstreamDns;
use op_whitelist::{FetchError, Policy, PolicySource};
use rustc_hash::FxHashMap;
use tempfile::TempDir;

pub const UPSTREAM: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

/// Counts mutations in flight across collaborators; any overlap is recorded.
#[derive(Default)]
pub struct Activity {
    in_flight: AtomicU32,
    pub overlapped: AtomicBool,
}

impl Activity {
    async fn enter(&self, hold: Duration) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub enum Response {
    Document(String),
    Unreachable,
}

pub struct FakeSource {
    response: Mutex<Response>,
}

impl FakeSource {
    pub fn serve(&self, doc: &str) {
        *self.response.lock().unwrap() = Response::Document(doc.to_string());
    }

    pub fn go_offline(&self) {
        *self.response.lock().unwrap() = Response::Unreachable;
    }
}

#[async_trait]
impl PolicySource for FakeSource {
    async fn fetch(&self) -> Result<Policy, FetchError> {
        let doc = match &*self.response.lock().unwrap() {
            Response::Document(doc) => doc.clone(),
            Response::Unreachable => {
                return Err(FetchError::Unreachable("timed out".to_string()));
            }
        };
        Ok(op_whitelist::parse(&doc)?)
    }
}

pub struct FakeResolver {
    pub running: AtomicBool,
    pub restart_fixes: AtomicBool,
    pub fail_reload: AtomicBool,
    pub restarts: AtomicU32,
    pub reloads: AtomicU32,
    activity: Arc<Activity>,
}

#[async_trait]
impl ResolverService for FakeResolver {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.restart_fixes.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.activity.enter(Duration::ZERO).await;
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(anyhow!("dnsmasq: bad config"));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeFirewall {
    pub active: AtomicBool,
    pub applies: AtomicU32,
    pub flushes: AtomicU32,
    pub hold: Mutex<Duration>,
    activity: Arc<Activity>,
}

impl FakeFirewall {
    fn hold(&self) -> Duration {
        *self.hold.lock().unwrap()
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn apply(&self, _upstream: &UpstreamDns) -> Result<()> {
        self.activity.enter(self.hold()).await;
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.activity.enter(self.hold()).await;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeBrowsers {
    pub closes: AtomicU32,
}

#[async_trait]
impl BrowserControl for FakeBrowsers {
    async fn close_all(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeHostDns {
    pub local: AtomicBool,
    pub resets: AtomicU32,
}

#[async_trait]
impl HostResolverConfig for FakeHostDns {
    async fn points_to_local(&self) -> bool {
        self.local.load(Ordering::SeqCst)
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.local.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Names resolve when listed with `true`; anything else is NXDOMAIN.
#[derive(Default)]
pub struct FakeProber {
    answers: Mutex<FxHashMap<String, bool>>,
}

impl FakeProber {
    pub fn set(&self, name: &str, resolves: bool) {
        self.answers.lock().unwrap().insert(name.to_string(), resolves);
    }
}

#[async_trait]
impl DnsProber for FakeProber {
    async fn resolves(&self, name: &str) -> Result<bool> {
        Ok(self.answers.lock().unwrap().get(name).copied().unwrap_or(false))
    }
}

pub struct FakePortal {
    pub behind: AtomicBool,
    pub unreachable: AtomicBool,
}

#[async_trait]
impl PortalProbe for FakePortal {
    async fn behind_portal(&self) -> Result<bool> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("network is unreachable"));
        }
        Ok(self.behind.load(Ordering::SeqCst))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<EnvConfig>,
    pub activity: Arc<Activity>,
    pub source: Arc<FakeSource>,
    pub resolver: Arc<FakeResolver>,
    pub firewall: Arc<FakeFirewall>,
    pub browsers: Arc<FakeBrowsers>,
    pub host_dns: Arc<FakeHostDns>,
    pub prober: Arc<FakeProber>,
    pub portal: Arc<FakePortal>,
    pub enforcer: Arc<Enforcer>,
    pub engine: Arc<ReconciliationEngine>,
}

/// A healthy machine serving `doc`, nothing applied yet.
pub fn harness(doc: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(EnvConfig::rooted_at(dir.path()));
    let activity = Arc::new(Activity::default());

    let source = Arc::new(FakeSource {
        response: Mutex::new(Response::Document(doc.to_string())),
    });
    let resolver = Arc::new(FakeResolver {
        running: AtomicBool::new(true),
        restart_fixes: AtomicBool::new(true),
        fail_reload: AtomicBool::new(false),
        restarts: AtomicU32::new(0),
        reloads: AtomicU32::new(0),
        activity: Arc::clone(&activity),
    });
    let firewall = Arc::new(FakeFirewall {
        active: AtomicBool::new(false),
        applies: AtomicU32::new(0),
        flushes: AtomicU32::new(0),
        hold: Mutex::new(Duration::ZERO),
        activity: Arc::clone(&activity),
    });
    let browsers = Arc::new(FakeBrowsers::default());
    let host_dns = Arc::new(FakeHostDns {
        local: AtomicBool::new(true),
        resets: AtomicU32::new(0),
    });
    let prober = Arc::new(FakeProber::default());
    prober.set(&config.health_domain, true);
    let portal = Arc::new(FakePortal {
        behind: AtomicBool::new(false),
        unreachable: AtomicBool::new(false),
    });

    let system = SystemHandles {
        resolver: resolver.clone(),
        firewall: firewall.clone(),
        browsers: browsers.clone(),
        host_dns: host_dns.clone(),
        prober: prober.clone(),
    };
    let upstream = UpstreamDns::new(IpAddr::V4(UPSTREAM));
    let enforcer = Arc::new(Enforcer::new(Arc::clone(&config), upstream, system));
    let engine = Arc::new(ReconciliationEngine::new(source.clone(), Arc::clone(&enforcer)));

    Harness {
        dir,
        config,
        activity,
        source,
        resolver,
        firewall,
        browsers,
        host_dns,
        prober,
        portal,
        enforcer,
        engine,
    }
}

impl Harness {
    pub fn state(&self) -> ReconciliationState {
        self.enforcer.store().load()
    }

    pub fn save_state(&self, state: &ReconciliationState) {
        self.enforcer.store().save(state).unwrap();
    }

    pub fn dns_config(&self) -> String {
        std::fs::read_to_string(&self.config.dnsmasq_config_path).unwrap()
    }

    pub fn firefox_policy(&self) -> serde_json::Value {
        let content = std::fs::read_to_string(&self.config.firefox_policy_path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    pub fn chromium_policy(&self) -> serde_json::Value {
        let content = std::fs::read_to_string(&self.config.chromium_policy_paths[0]).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    pub fn watchdog(&self) -> HealthWatchdog {
        HealthWatchdog::new(Arc::clone(&self.enforcer))
    }

    pub fn coordinator(&self) -> Arc<CaptivePortalCoordinator> {
        Arc::new(CaptivePortalCoordinator::new(
            self.portal.clone(),
            Arc::clone(&self.enforcer),
        ))
    }

    pub fn closes(&self) -> u32 {
        self.browsers.closes.load(std::sync::atomic::Ordering::SeqCst)
    }
}
