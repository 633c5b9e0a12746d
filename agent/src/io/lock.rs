//! Pid-stamped lock files serializing session transactions against execution.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::io::process::pid_alive;

/// Held while a session transaction (rotate, archive, restore, clean) runs.
pub const SESSION_LOCK: &str = ".session.lock";
/// Held by the orchestrator while a command executes.
pub const ITERATION_LOCK: &str = ".iteration.lock";

/// Exclusive lock released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Take the lock at `path`, failing with [`AgentError::WorkspaceBusy`] if it
    /// or any of `conflicts` is held by a live process.
    pub fn acquire(path: &Path, conflicts: &[PathBuf]) -> Result<Self> {
        reclaim_if_stale(path)?;
        let pid = std::process::id();
        let tmp = path.with_extension(format!("lock.{pid}.tmp"));
        fs::write(&tmp, format!("{pid}\n"))
            .with_context(|| format!("write lock candidate {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(busy(path));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create lock {}", path.display()));
            }
        }
        let guard = Self {
            path: path.to_path_buf(),
        };
        for conflict in conflicts {
            reclaim_if_stale(conflict)?;
            if conflict.exists() {
                return Err(busy(conflict));
            }
        }
        debug!(lock = %path.display(), "lock acquired");
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(err = %e, lock = %self.path.display(), "failed to release lock");
        }
    }
}

fn busy(path: &Path) -> anyhow::Error {
    let owner = read_owner(path)
        .map(|pid| format!(" (pid {pid})"))
        .unwrap_or_default();
    AgentError::WorkspaceBusy(format!("{} is held{owner}", path.display())).into()
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a live process holds the lock at `path`.
pub fn is_held(path: &Path) -> bool {
    path.exists() && read_owner(path).is_some_and(pid_alive)
}

fn reclaim_if_stale(path: &Path) -> Result<()> {
    if !path.exists() || is_held(path) {
        return Ok(());
    }
    warn!(lock = %path.display(), "reclaiming stale lock");
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("remove stale lock {}", path.display()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(SESSION_LOCK);
        let guard = LockGuard::acquire(&path, &[]).expect("first");
        let err = LockGuard::acquire(&path, &[]).expect_err("second");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::WorkspaceBusy(_))
        ));
        drop(guard);
        assert!(!path.exists());
        LockGuard::acquire(&path, &[]).expect("after release");
    }

    #[test]
    fn held_conflict_blocks_and_releases_own_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = temp.path().join(SESSION_LOCK);
        let iteration = temp.path().join(ITERATION_LOCK);
        let _held = LockGuard::acquire(&iteration, &[]).expect("iteration");
        let err = LockGuard::acquire(&session, std::slice::from_ref(&iteration))
            .expect_err("conflict");
        assert!(err.to_string().contains(ITERATION_LOCK));
        assert!(!session.exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(SESSION_LOCK);
        fs::write(&path, "999999999\n").expect("write stale");
        assert!(!is_held(&path));
        let _guard = LockGuard::acquire(&path, &[]).expect("reclaim");
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }
}
