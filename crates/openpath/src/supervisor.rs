use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Priorité d'une tâche périodique, détermine la politique de redémarrage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// Watchdog de santé : c'est lui qui déclenche le fail-open, retries illimités
    Critical,
    /// Réconciliation, portail captif : backoff progressif, max 10 retries
    Important,
}

impl TaskPriority {
    fn max_retries(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::Important => 10,
        }
    }

    fn backoff(self, retry: u32) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(500 * retry.min(20) as u64),
            Self::Important => Duration::from_secs(2 * retry as u64),
        }
    }
}

/// Lance une tâche supervisée
///
/// Une tâche qui retourne une erreur ou panique est relancée selon sa priorité.
/// Le compteur de retries repart à zéro si la tâche a tourné plus de 5 minutes.
pub fn spawn_supervised<F, Fut>(name: &'static str, priority: TaskPriority, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let max_retries = priority.max_retries();
        let mut retries: u32 = 0;

        loop {
            info!(task = name, "Starting task");
            let started = Instant::now();

            let f = Arc::clone(&factory);
            let result = tokio::spawn(async move { f().await }).await;

            match result {
                Ok(Ok(())) => {
                    info!(task = name, "Task exited cleanly");
                    break;
                }
                Ok(Err(e)) => error!(task = name, "Task failed: {e:#}"),
                Err(join_error) => error!(task = name, "Task panicked: {join_error}"),
            }

            if started.elapsed() > Duration::from_secs(300) {
                retries = 0;
            }
            retries = retries.saturating_add(1);

            if retries > max_retries {
                error!(task = name, max_retries, "Task exceeded max retries, giving up");
                break;
            }

            let backoff = priority.backoff(retries);
            warn!(task = name, ?backoff, attempt = retries, "Restarting task");
            tokio::time::sleep(backoff).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_failed_task_is_restarted() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = spawn_supervised("flaky", TaskPriority::Critical, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("boom");
                }
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_important_gives_up() {
        assert_eq!(TaskPriority::Important.max_retries(), 10);
        assert!(TaskPriority::Critical.backoff(100) <= Duration::from_secs(10));
    }
}
