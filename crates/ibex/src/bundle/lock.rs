//! Advisory bundle locking.
//!
//! A sibling lock file inside the bundle directory marks an in-flight
//! launch. Presence means immediate failure — there is no blocking or
//! retry, so a second concurrent create on the same bundle errors out
//! right away instead of queuing.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use ibex_common::paths::BUNDLE_LOCK_FILE;
use ibex_common::{IbexError, IbexResult};

/// Holds the bundle lock for the lifetime of a launch.
#[derive(Debug)]
pub struct BundleLock {
    path: PathBuf,
    held: bool,
}

impl BundleLock {
    /// Acquire the lock, failing immediately when it is already held.
    pub fn acquire(bundle: &Path) -> IbexResult<Self> {
        let path = bundle.join(BUNDLE_LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                tracing::debug!(lock = %path.display(), "bundle lock acquired");
                Ok(Self { path, held: true })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(IbexError::BundleLocked { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock. Failure is logged, never returned — releasing
    /// happens on cleanup paths where the payload result must win.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "bundle lock release failed");
        } else {
            tracing::debug!(lock = %self.path.display(), "bundle lock released");
        }
    }
}

impl Drop for BundleLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let _lock = BundleLock::acquire(tmp.path()).unwrap();
        let err = BundleLock::acquire(tmp.path()).unwrap_err();
        assert!(matches!(err, IbexError::BundleLocked { .. }));
    }

    #[test]
    fn release_allows_reacquire() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = BundleLock::acquire(tmp.path()).unwrap();
        lock.release();
        assert!(BundleLock::acquire(tmp.path()).is_ok());
    }

    #[test]
    fn drop_releases_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let _lock = BundleLock::acquire(tmp.path()).unwrap();
        }
        assert!(!tmp.path().join(BUNDLE_LOCK_FILE).exists());
    }
}
