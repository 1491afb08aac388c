//! Advisory lock guarding every sequence that mutates enforcement.
//!
//! Acquisition never waits: a contended lock means another task (or a CLI
//! invocation) is already working and this tick is skipped.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

#[derive(Debug, Clone)]
pub struct EnforcementLock {
    path: PathBuf,
}

/// Proof that the enforcement lock is held. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    holder: &'static str,
}

impl EnforcementLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock for `holder`. `Ok(None)` when someone else has it.
    pub fn try_acquire(&self, holder: &'static str) -> std::io::Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        // SAFETY: the fd is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                debug!(holder, "Enforcement lock busy");
                return Ok(None);
            }
            return Err(err);
        }

        // Record who holds it for `status`; failure here is cosmetic.
        let _ = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{} {}", std::process::id(), holder));

        Ok(Some(LockGuard { file, holder }))
    }

    /// Current holder as recorded in the lock file, if the lock is taken.
    pub fn holder(&self) -> Option<String> {
        match self.try_acquire("probe") {
            Ok(Some(_guard)) => None,
            Ok(None) => {
                let mut content = String::new();
                File::open(&self.path)
                    .and_then(|mut f| f.read_to_string(&mut content))
                    .ok()?;
                let content = content.trim();
                if content.is_empty() {
                    Some("unknown".to_string())
                } else {
                    Some(content.to_string())
                }
            }
            Err(_) => None,
        }
    }
}

impl LockGuard {
    pub fn holder(&self) -> &'static str {
        self.holder
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the fd releases the lock too; unlock explicitly so the
        // release does not depend on every fd clone being gone.
        // SAFETY: the fd is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(holder = self.holder, "Enforcement lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let lock = EnforcementLock::new(dir.path().join("openpath.lock"));

        let first = lock.try_acquire("reconcile").unwrap();
        assert!(first.is_some());
        assert!(lock.try_acquire("watchdog").unwrap().is_none());

        drop(first);
        assert!(lock.try_acquire("watchdog").unwrap().is_some());
    }

    #[test]
    fn test_holder_is_reported() {
        let dir = tempdir().unwrap();
        let lock = EnforcementLock::new(dir.path().join("openpath.lock"));
        assert!(lock.holder().is_none());

        let _guard = lock.try_acquire("captive-portal").unwrap().unwrap();
        let holder = lock.holder().unwrap();
        assert!(holder.ends_with("captive-portal"));
    }

    #[test]
    fn test_threads_exclude_each_other() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempdir().unwrap();
        let lock = Arc::new(EnforcementLock::new(dir.path().join("openpath.lock")));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if let Some(_guard) = lock.try_acquire("test").unwrap() {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
