mod supervisor;

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use op_common::EnvConfig;
use op_enforcer::system::{DnsProber, LocalDnsProber};
use op_enforcer::{
    CaptivePortalCoordinator, CycleMode, CycleOutcome, Enforcer, HealthWatchdog, HttpPortalProbe,
    ReconciliationEngine, StatusReport, SystemHandles,
};
use op_sinkhole::UpstreamDns;
use op_sinkhole::upstream::{self, UpstreamDiscovery};
use op_whitelist::{Policy, WhitelistFetcher, source};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use supervisor::{TaskPriority, spawn_supervised};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Resolver configs consulted during upstream discovery, most specific first.
const RESOLV_CONF_CANDIDATES: [&str; 2] = ["/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

#[derive(Parser)]
#[command(name = "openpath", version, about = "DNS sinkhole policy enforcement")]
struct Cli {
    /// Environment file loaded before reading the process environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation, health and captive portal loops
    Daemon,
    /// Run one reconciliation cycle now
    Update,
    /// Re-apply the whole policy, ignoring change detection
    ForceApply,
    /// Show persisted state and live health checks
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the domains allowed by the last good whitelist
    Domains,
    /// Check whether domains are allowed and resolve through the sinkhole
    Check {
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // The env file is applied before the runtime starts its worker threads.
    let config = Arc::new(EnvConfig::load(cli.env_file.as_deref()));
    init_tracing(config.log_json);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, config: Arc<EnvConfig>) -> anyhow::Result<()> {
    match command {
        Commands::Daemon => run_daemon(config).await,
        Commands::Update => run_once(config, CycleMode::Normal).await,
        Commands::ForceApply => run_once(config, CycleMode::Force).await,
        Commands::Status { json } => show_status(config, json).await,
        Commands::Domains => list_domains(&config),
        Commands::Check { domains } => check_domains(&config, &domains).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,openpath=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn fallback_upstream(config: &EnvConfig) -> IpAddr {
    config.fallback_upstream_dns.parse().unwrap_or_else(|_| {
        warn!(
            value = %config.fallback_upstream_dns,
            "Invalid FALLBACK_UPSTREAM_DNS, using 8.8.8.8"
        );
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
    })
}

/// Validated discovery, for commands that apply configuration.
async fn discover_upstream(config: &EnvConfig) -> UpstreamDns {
    let cache_path = config.upstream_cache_path();
    let resolv_conf_paths: Vec<&Path> = RESOLV_CONF_CANDIDATES.iter().map(Path::new).collect();
    let discovery = UpstreamDiscovery {
        cache_path: &cache_path,
        resolv_conf_paths: &resolv_conf_paths,
        validation_domain: &config.health_domain,
        probe_timeout: config.probe_timeout(),
        fallback: fallback_upstream(config),
    };
    let (upstream, source) = discovery.discover().await;
    info!(%upstream, ?source, "Upstream DNS");
    upstream
}

/// Persisted upstream without probing, for read-only commands.
fn cached_upstream(config: &EnvConfig) -> UpstreamDns {
    let ip = upstream::load_cached(&config.upstream_cache_path())
        .unwrap_or_else(|| fallback_upstream(config));
    UpstreamDns::new(ip)
}

fn build_engine(config: &Arc<EnvConfig>, enforcer: &Arc<Enforcer>) -> anyhow::Result<ReconciliationEngine> {
    let fetcher = WhitelistFetcher::new(config.whitelist_url.clone(), config.fetch_timeout())
        .context("Failed to build whitelist fetcher")?;
    if fetcher.url().is_none() {
        warn!("WHITELIST_URL is not set, reconciliation will keep the current configuration");
    }
    Ok(ReconciliationEngine::new(Arc::new(fetcher), Arc::clone(enforcer)))
}

async fn run_daemon(config: Arc<EnvConfig>) -> anyhow::Result<()> {
    info!("openpath starting...");

    let upstream = discover_upstream(&config).await;
    let system = SystemHandles::from_config(&config);
    let enforcer = Arc::new(Enforcer::new(Arc::clone(&config), upstream, system));

    let engine = Arc::new(build_engine(&config, &enforcer)?);
    let watchdog = Arc::new(HealthWatchdog::new(Arc::clone(&enforcer)));
    let probe = HttpPortalProbe::new(
        &config.captive_portal_url,
        &config.captive_portal_expected,
        config.probe_timeout(),
    )?;
    let coordinator = Arc::new(CaptivePortalCoordinator::new(Arc::new(probe), Arc::clone(&enforcer)));
    let trigger = Arc::new(Notify::new());

    // ── Supervised loops ───────────────────────────────────────────────

    let reconcile_period = Duration::from_secs(config.reconcile_interval_secs);
    let engine_c = Arc::clone(&engine);
    let trigger_c = Arc::clone(&trigger);
    spawn_supervised("reconcile", TaskPriority::Important, move || {
        let engine = Arc::clone(&engine_c);
        let trigger = Arc::clone(&trigger_c);
        async move { engine.run(reconcile_period, trigger).await }
    });

    let watchdog_period = Duration::from_secs(config.watchdog_interval_secs);
    spawn_supervised("health-watchdog", TaskPriority::Critical, move || {
        let watchdog = Arc::clone(&watchdog);
        async move { watchdog.run(watchdog_period).await }
    });

    let captive_period = Duration::from_secs(config.captive_interval_secs);
    spawn_supervised("captive-portal", TaskPriority::Important, move || {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.run(captive_period).await }
    });

    // ── SIGHUP: reconcile now ──────────────────────────────────────────

    let trigger_hup = Arc::clone(&trigger);
    tokio::spawn(async move {
        if let Err(e) = handle_sighup(trigger_hup).await {
            error!("SIGHUP handler error: {}", e);
        }
    });

    info!(
        upstream = %enforcer.upstream(),
        reconcile_secs = config.reconcile_interval_secs,
        watchdog_secs = config.watchdog_interval_secs,
        captive_secs = config.captive_interval_secs,
        "openpath started"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    info!("Shutting down...");
    Ok(())
}

async fn handle_sighup(trigger: Arc<Notify>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;
    while let Some(sig) = signals.next().await {
        if sig == SIGHUP {
            info!("Received SIGHUP, triggering reconciliation");
            trigger.notify_one();
        }
    }
    Ok(())
}

async fn run_once(config: Arc<EnvConfig>, mode: CycleMode) -> anyhow::Result<()> {
    let upstream = discover_upstream(&config).await;
    let system = SystemHandles::from_config(&config);
    let enforcer = Arc::new(Enforcer::new(Arc::clone(&config), upstream, system));
    let engine = build_engine(&config, &enforcer)?;

    match engine.run_cycle(mode).await {
        CycleOutcome::Skipped => {
            let holder = enforcer.lock().holder().unwrap_or_else(|| "unknown".into());
            bail!("Enforcement lock is held ({holder}), try again later")
        }
        CycleOutcome::Failed(e) => Err(e.into()),
        CycleOutcome::Unreachable => bail!("Whitelist unreachable, configuration left unchanged"),
        CycleOutcome::Rejected => bail!("Whitelist rejected, configuration left unchanged"),
        CycleOutcome::HeldFailOpen => {
            println!("Health watchdog holds fail-open; use force-apply to override");
            Ok(())
        }
        CycleOutcome::Unchanged => {
            println!("Policy unchanged");
            Ok(())
        }
        CycleOutcome::EmergencyDisabled => {
            println!("Whitelist disabled: enforcement turned off");
            Ok(())
        }
        CycleOutcome::Applied {
            dns_changed,
            browser_changed,
            browsers_closed,
        } => {
            println!(
                "Policy applied (dns: {}, browsers: {}, browsers closed: {})",
                changed_label(dns_changed),
                changed_label(browser_changed),
                changed_label(browsers_closed)
            );
            Ok(())
        }
    }
}

fn changed_label(b: bool) -> &'static str {
    if b { "changed" } else { "unchanged" }
}

async fn show_status(config: Arc<EnvConfig>, json: bool) -> anyhow::Result<()> {
    let system = SystemHandles::from_config(&config);
    let enforcer = Arc::new(Enforcer::new(Arc::clone(&config), cached_upstream(&config), system));
    let report = StatusReport::collect(&enforcer).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    if !report.healthy() {
        std::process::exit(1);
    }
    Ok(())
}

fn cached_policy(config: &EnvConfig) -> anyhow::Result<Policy> {
    let path = config.whitelist_cache_path();
    source::load_cache(&path)
        .with_context(|| format!("No cached whitelist at {}", path.display()))
}

fn list_domains(config: &EnvConfig) -> anyhow::Result<()> {
    match cached_policy(config)? {
        Policy::Disabled => println!("Whitelist disabled: every domain is allowed"),
        Policy::Active(rules) => {
            for domain in rules.sorted_domains() {
                println!("{domain}");
            }
        }
    }
    Ok(())
}

async fn check_domains(config: &EnvConfig, domains: &[String]) -> anyhow::Result<()> {
    let policy = cached_policy(config)?;
    let prober = LocalDnsProber::new(config.probe_timeout());
    let essential = config.essential_domains();

    for raw in domains {
        let domain = op_whitelist::policy::normalize_domain(raw);
        let allowed = match &policy {
            Policy::Disabled => true,
            Policy::Active(rules) => {
                rules.allows(&domain) || essential.iter().any(|e| covers(e, &domain))
            }
        };
        let resolves = match prober.resolves(&domain).await {
            Ok(true) => "resolves",
            Ok(false) => "does not resolve",
            Err(_) => "no answer",
        };
        println!(
            "{domain}: {} by policy, {resolves}",
            if allowed { "allowed" } else { "blocked" }
        );
    }
    Ok(())
}

fn covers(parent: &str, domain: &str) -> bool {
    domain == parent || domain.ends_with(&format!(".{parent}"))
}
