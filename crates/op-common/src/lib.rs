pub mod config;
pub mod error;
pub mod fs;
pub mod lock;
pub mod state;

pub use config::EnvConfig;
pub use error::{EnforceError, Result};
pub use lock::{EnforcementLock, LockGuard};
pub use state::{FailOpenReason, ReconciliationState, StateStore};
