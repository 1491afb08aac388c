mod common;

use std::sync::atomic::Ordering;

use common::{Harness, harness};
use op_common::FailOpenReason;
use op_enforcer::{CycleMode, CycleOutcome, WatchdogOutcome};

async fn enforcing() -> Harness {
    let h = harness("google.com\nwikipedia.org\n");
    assert!(matches!(
        h.engine.run_cycle(CycleMode::Normal).await,
        CycleOutcome::Applied { .. }
    ));
    h
}

fn break_resolver(h: &Harness) {
    h.resolver.running.store(false, Ordering::SeqCst);
    h.resolver.restart_fixes.store(false, Ordering::SeqCst);
}

fn fix_resolver(h: &Harness) {
    h.resolver.restart_fixes.store(true, Ordering::SeqCst);
}

#[tokio::test]
async fn test_clean_run_is_healthy() {
    let h = enforcing().await;
    let outcome = h.watchdog().run_once().await;

    assert_eq!(outcome, WatchdogOutcome::Healthy);
    let state = h.state();
    assert_eq!(state.consecutive_failure_count, 0);
    assert!(state.last_health_check_at.is_some());
    assert_eq!(h.resolver.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_whitelist_without_health_domain_stays_healthy() {
    let h = harness("wikipedia.org\n");
    h.engine.run_cycle(CycleMode::Normal).await;

    // Answer the known-good lookup the way the written sinkhole would.
    let health = h.config.health_domain.clone();
    let forwarded = h.dns_config().contains(&format!("server=/{health}/"));
    h.prober.set(&health, forwarded);

    let watchdog = h.watchdog();
    for _ in 0..3 {
        assert_eq!(watchdog.run_once().await, WatchdogOutcome::Healthy);
    }
    let state = h.state();
    assert!(state.enforcement_enabled);
    assert_eq!(state.consecutive_failure_count, 0);
    assert_eq!(h.resolver.restarts.load(Ordering::SeqCst), 0);
}

/// Trois passages en échec d'affilée forcent le fail-open
#[tokio::test]
async fn test_three_failed_runs_fail_open() {
    let h = enforcing().await;
    break_resolver(&h);
    let watchdog = h.watchdog();

    assert_eq!(watchdog.run_once().await, WatchdogOutcome::Degraded { failures: 1 });
    assert_eq!(watchdog.run_once().await, WatchdogOutcome::Degraded { failures: 2 });
    assert!(h.state().enforcement_enabled);

    assert_eq!(watchdog.run_once().await, WatchdogOutcome::FailedOpen);
    let state = h.state();
    assert!(!state.enforcement_enabled);
    assert_eq!(state.fail_open_reason, Some(FailOpenReason::HealthWatchdog));
    assert_eq!(state.consecutive_failure_count, 3);
    assert_eq!(h.firewall.flushes.load(Ordering::SeqCst), 1);
    // One close for the initial apply, one for fail-open.
    assert_eq!(h.closes(), 2);

    // The engine does not turn enforcement back on while tripped.
    assert!(matches!(
        h.engine.run_cycle(CycleMode::Normal).await,
        CycleOutcome::HeldFailOpen
    ));
}

/// Un passage sain entre deux échecs remet le compteur à zéro
#[tokio::test]
async fn test_intervening_success_resets_count() {
    let h = enforcing().await;
    let watchdog = h.watchdog();

    break_resolver(&h);
    watchdog.run_once().await;
    watchdog.run_once().await;
    assert_eq!(h.state().consecutive_failure_count, 2);

    fix_resolver(&h);
    assert_eq!(watchdog.run_once().await, WatchdogOutcome::Healthy);
    assert_eq!(h.state().consecutive_failure_count, 0);

    break_resolver(&h);
    assert_eq!(watchdog.run_once().await, WatchdogOutcome::Degraded { failures: 1 });
    assert!(h.state().enforcement_enabled);
    assert_eq!(h.firewall.flushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovered_issues_count_as_healthy() {
    let h = enforcing().await;
    h.resolver.running.store(false, Ordering::SeqCst);
    h.host_dns.local.store(false, Ordering::SeqCst);
    h.firewall.active.store(false, Ordering::SeqCst);
    let applies = h.firewall.applies.load(Ordering::SeqCst);

    assert_eq!(h.watchdog().run_once().await, WatchdogOutcome::Healthy);
    assert_eq!(h.resolver.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(h.host_dns.resets.load(Ordering::SeqCst), 1);
    assert_eq!(h.firewall.applies.load(Ordering::SeqCst), applies + 1);
}

#[tokio::test]
async fn test_known_good_domain_failure_restarts_resolver() {
    let h = enforcing().await;
    h.prober.set(&h.config.health_domain, false);

    let outcome = h.watchdog().run_once().await;
    assert_eq!(outcome, WatchdogOutcome::Degraded { failures: 1 });
    assert_eq!(h.resolver.restarts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sinkhole_leak_is_reported_not_fixed() {
    let h = enforcing().await;
    h.prober.set(&h.config.sinkhole_probe_domain, true);

    let outcome = h.watchdog().run_once().await;
    assert_eq!(outcome, WatchdogOutcome::Degraded { failures: 1 });

    let checks = h.watchdog().inspect().await;
    let sinkhole = checks.iter().find(|c| c.name == "sinkhole-blocks").unwrap();
    assert!(!sinkhole.ok);
    assert!(sinkhole
        .detail
        .as_deref()
        .unwrap()
        .contains("deny-all rule present but not honoured"));
    assert_eq!(h.resolver.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sinkhole_check_skipped_when_probe_domain_allowed() {
    let h = harness("example.com\n");
    h.engine.run_cycle(CycleMode::Normal).await;
    h.prober.set("example.com", true);

    assert_eq!(h.watchdog().run_once().await, WatchdogOutcome::Healthy);
}

#[tokio::test]
async fn test_enforcement_checks_skipped_when_not_enforcing() {
    let h = harness("google.com\n");
    h.firewall.active.store(false, Ordering::SeqCst);
    h.prober.set(&h.config.sinkhole_probe_domain, true);

    let checks = h.watchdog().inspect().await;
    assert!(checks.iter().all(|c| c.name != "firewall-active"));
    assert!(checks.iter().all(|c| c.name != "sinkhole-blocks"));
    assert!(checks.iter().all(|c| c.ok));
}

#[tokio::test]
async fn test_clean_run_after_fail_open_lets_engine_reenable() {
    let h = enforcing().await;
    break_resolver(&h);
    let watchdog = h.watchdog();
    for _ in 0..3 {
        watchdog.run_once().await;
    }
    assert!(!h.state().enforcement_enabled);

    fix_resolver(&h);
    assert_eq!(watchdog.run_once().await, WatchdogOutcome::Healthy);

    let outcome = h.engine.run_cycle(CycleMode::Normal).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Applied {
            dns_changed: true,
            browsers_closed: true,
            ..
        }
    ));
    let state = h.state();
    assert!(state.enforcement_enabled);
    assert_eq!(state.fail_open_reason, None);
}

#[tokio::test]
async fn test_busy_lock_skips_run() {
    let h = enforcing().await;
    break_resolver(&h);
    let _guard = h.enforcer.try_lock("test").unwrap().unwrap();

    assert_eq!(h.watchdog().run_once().await, WatchdogOutcome::Skipped);
    assert_eq!(h.state().consecutive_failure_count, 0);
}
