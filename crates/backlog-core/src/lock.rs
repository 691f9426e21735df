//! Short-lived advisory file locks.
//!
//! These guard the read-modify-write critical sections of the store: one
//! lock per work item (`_meta/locks/<ID>.mutex`) and one per identifier
//! counter (`_meta/counters/<CODE>.lock`). They are held for milliseconds
//! and released on drop. Long-lived ownership of an item while an agent
//! works on it is a different mechanism, see [`crate::guard`].

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Default bounded wait for mutation and counter locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Advisory lock errors.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    Io { path: PathBuf, source: io::Error },
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::RecordWriteFailed,
        }
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { path, waited } => write!(
                f,
                "{}: lock timed out after {:?} at {}",
                self.code().code(),
                waited,
                path.display()
            ),
            Self::Io { path, source } => {
                write!(f, "{}: {} ({})", self.code().code(), source, path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Timeout { .. } => None,
            Self::Io { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        let parent = path.parent().ok_or_else(|| {
            io_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "lock path has no parent",
            ))
        })?;
        fs::create_dir_all(parent).map_err(io_err)?;

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(io_err)?;

            if FileExt::try_lock_exclusive(&file).is_ok() {
                tracing::trace!(path = %path.display(), "lock acquired");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::trace!(path = %self.path.display(), "lock released");
    }
}

/// RAII guard serializing mutation of a single work item.
#[derive(Debug)]
pub struct MutationLock {
    _guard: FileGuard,
}

impl MutationLock {
    /// Acquire the exclusive mutation lock at `path`, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            _guard: FileGuard::acquire(path, timeout)?,
        })
    }
}

/// RAII guard serializing access to one identifier counter.
#[derive(Debug)]
pub struct CounterLock {
    _guard: FileGuard,
}

impl CounterLock {
    /// Acquire the exclusive counter lock at `path`, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            _guard: FileGuard::acquire(path, timeout)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CounterLock, LockError, MutationLock};
    use crate::error::ErrorCode;
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    #[test]
    fn mutation_lock_acquires_and_releases_on_drop() -> Result<(), LockError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locks/APP-TSK-0001.mutex");
        {
            let _lock = MutationLock::acquire(&path, Duration::from_millis(50))?;
            assert!(MutationLock::acquire(&path, Duration::from_millis(10)).is_err());
        }
        let _again = MutationLock::acquire(&path, Duration::from_millis(50))?;
        Ok(())
    }

    #[test]
    fn mutation_lock_times_out_when_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("held.mutex");
        let _guard = MutationLock::acquire(&path, Duration::from_millis(50)).expect("first");
        let err = MutationLock::acquire(&path, Duration::from_millis(20)).expect_err("held");

        assert!(matches!(err, LockError::Timeout { path: ref p, .. } if *p == path));
        assert_eq!(err.code(), ErrorCode::LockContention);
    }

    #[test]
    fn counter_lock_waits_for_holder() -> Result<(), LockError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counters/TSK.lock");

        let held = Arc::new(Barrier::new(2));
        let held_thread = Arc::clone(&held);
        let path_in_thread = path.clone();
        let handle = thread::spawn(move || {
            let _lock =
                CounterLock::acquire(&path_in_thread, Duration::from_millis(200)).expect("lock");
            held_thread.wait();
            thread::sleep(Duration::from_millis(30));
        });

        held.wait();
        let _lock = CounterLock::acquire(&path, Duration::from_secs(2))?;
        assert!(path.exists());
        handle.join().expect("holder thread");
        Ok(())
    }
}
