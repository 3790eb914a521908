//! Advisory file locking shared by independent processes.
//!
//! The lock lives in a sibling `<registry>.lock` file because the registry
//! document itself is replaced by rename on every write. Within one process a
//! [`FileLock`] is re-entrant: nested acquisitions bump a depth counter and the
//! OS lock is released only when the outermost guard drops.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use fs4::FileExt;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::RegistryError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct Held {
    file: File,
    mode: LockMode,
    depth: usize,
}

#[derive(Debug)]
struct Inner {
    path: Utf8PathBuf,
    held: Mutex<Option<Held>>,
}

/// Lock handle for one registry file. Cloning shares the depth counter.
#[derive(Debug, Clone)]
pub struct FileLock {
    inner: Arc<Inner>,
}

/// Releases one level of a [`FileLock`] when dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    inner: Arc<Inner>,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

pub fn lock_path_for(registry: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{registry}.lock"))
}

impl FileLock {
    pub fn for_registry(registry: &Utf8Path) -> Self {
        Self::new(lock_path_for(registry))
    }

    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                held: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.inner.path
    }

    /// Current nesting depth; zero when the OS lock is not held.
    pub fn depth(&self) -> usize {
        self.state().as_ref().map(|held| held.depth).unwrap_or(0)
    }

    pub fn acquire(
        &self,
        mode: LockMode,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<LockGuard, RegistryError> {
        {
            let mut state = self.state();
            if let Some(held) = state.as_mut() {
                if held.mode == LockMode::Shared && mode == LockMode::Exclusive {
                    return Err(RegistryError::LockUpgrade(self.inner.path.clone()));
                }
                held.depth += 1;
                return Ok(self.guard(mode));
            }
        }

        let file = self.open_lock_file()?;
        let started = Instant::now();
        loop {
            if let Some(cancel) = cancel {
                cancel.check("waiting for registry lock")?;
            }
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(RegistryError::LockTimeout {
                            path: self.inner.path.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(RegistryError::Filesystem(format!(
                        "lock {}: {err}",
                        self.inner.path
                    )));
                }
            }
        }
        debug!(path = %self.inner.path, ?mode, "acquired registry lock");

        let mut state = self.state();
        *state = Some(Held {
            file,
            mode,
            depth: 1,
        });
        Ok(self.guard(mode))
    }

    fn guard(&self, mode: LockMode) -> LockGuard {
        LockGuard {
            inner: Arc::clone(&self.inner),
            mode,
        }
    }

    fn open_lock_file(&self) -> Result<File, RegistryError> {
        if let Some(parent) = self.inner.path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent.as_std_path())
                .map_err(|err| RegistryError::Filesystem(format!("create {parent}: {err}")))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.inner.path.as_std_path())
            .map_err(|err| RegistryError::Filesystem(format!("open {}: {err}", self.inner.path)))
    }

    fn state(&self) -> MutexGuard<'_, Option<Held>> {
        self.inner.state()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, Option<Held>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        let Some(held) = state.as_mut() else {
            return;
        };
        held.depth = held.depth.saturating_sub(1);
        if held.depth > 0 {
            return;
        }
        if let Some(held) = state.take() {
            if let Err(err) = FileExt::unlock(&held.file) {
                warn!(path = %self.inner.path, error = %err, "failed to release registry lock");
            }
            debug!(path = %self.inner.path, "released registry lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn lock_in(dir: &tempfile::TempDir) -> FileLock {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("registry.json")).unwrap();
        FileLock::for_registry(&path)
    }

    #[test]
    fn nested_acquire_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let outer = lock
            .acquire(LockMode::Exclusive, Duration::from_secs(1), None)
            .unwrap();
        let inner = lock
            .acquire(LockMode::Shared, Duration::from_secs(1), None)
            .unwrap();
        assert_eq!(lock.depth(), 2);
        drop(inner);
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn upgrade_from_shared_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let _shared = lock
            .acquire(LockMode::Shared, Duration::from_secs(1), None)
            .unwrap();
        assert_matches!(
            lock.acquire(LockMode::Exclusive, Duration::from_secs(1), None),
            Err(RegistryError::LockUpgrade(_))
        );
        assert_eq!(lock.depth(), 1);
    }

    #[test]
    fn cancelled_wait_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let holder = lock_in(&dir);
        let _held = holder
            .acquire(LockMode::Exclusive, Duration::from_secs(1), None)
            .unwrap();
        let waiter = lock_in(&dir);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_matches!(
            waiter.acquire(LockMode::Exclusive, Duration::from_secs(5), Some(&cancel)),
            Err(RegistryError::Cancelled(_))
        );
    }
}
