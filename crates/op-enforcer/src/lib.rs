pub mod captive;
pub mod enforcer;
pub mod engine;
pub mod status;
pub mod system;
pub mod watchdog;

pub use captive::{CaptiveOutcome, CaptivePortalCoordinator, HttpPortalProbe, PortalProbe};
pub use enforcer::Enforcer;
pub use engine::{CycleMode, CycleOutcome, EngineState, ReconciliationEngine};
pub use status::StatusReport;
pub use system::SystemHandles;
pub use watchdog::{CheckResult, HealthWatchdog, WatchdogOutcome};
