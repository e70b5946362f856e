// src/lockfile.rs

//! Single-instance advisory lock
//!
//! At most one orchestrator may be in its Execute phase per machine. The
//! lock is `flock(LOCK_EX)` on a file in the handler-state directory, held
//! for the duration of Execute and released on drop. A `.pid` companion
//! file identifies the holder so a superseding NoOperation can report who
//! it is waiting on.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a later invocation waits for the lock before giving up
const ACQUIRE_WAIT: Duration = Duration::from_secs(10 * 60);
const ACQUIRE_POLL: Duration = Duration::from_secs(2);

/// Exclusive orchestrator lock.
pub struct InstanceLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to acquire without blocking.
    ///
    /// Returns `Ok(None)` when another process holds the lock.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired orchestrator lock at {}", path.display());
                let lock = Self { file, path };
                lock.write_pid()?;
                Ok(Some(lock))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Orchestrator lock already held at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Acquire, waiting up to `ACQUIRE_WAIT` for the current holder.
    pub fn acquire_with_wait<P: AsRef<Path>>(path: P) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path.as_ref())? {
                return Ok(lock);
            }
            if started.elapsed() >= ACQUIRE_WAIT {
                let holder = Self::holder_pid(path.as_ref())
                    .map(|pid| format!(" (held by pid {})", pid))
                    .unwrap_or_default();
                return Err(Error::AlreadyRunning(format!(
                    "Timed out waiting for the orchestrator lock{}",
                    holder
                )));
            }
            std::thread::sleep(ACQUIRE_POLL);
        }
    }

    /// PID of the current holder, from the companion file.
    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        let pid_path = path.as_ref().with_extension("pid");
        fs::read_to_string(pid_path).ok()?.trim().parse().ok()
    }

    fn write_pid(&self) -> Result<()> {
        let pid_path = self.path.with_extension("pid");
        fs::write(pid_path, std::process::id().to_string())?;
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
        debug!("Released orchestrator lock at {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("orchestrator.lock");

        let lock = InstanceLock::try_acquire(&path).unwrap().unwrap();
        assert_eq!(InstanceLock::holder_pid(&path), Some(std::process::id()));

        // A second acquisition in the same process still conflicts: flock
        // is per-file-description and we opened a fresh one
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());

        drop(lock);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_pid_file_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("orchestrator.lock");
        let lock = InstanceLock::try_acquire(&path).unwrap().unwrap();
        drop(lock);
        assert_eq!(InstanceLock::holder_pid(&path), None);
    }
}
