use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held")]
    AlreadyLocked,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exclusive, non-blocking advisory lock backed by a per-VM file under the
/// run root. Dropping the guard releases the lock.
pub struct VmLock {
    flock: Option<Flock<File>>,
}

impl VmLock {
    pub fn acquire(path: &Path) -> Result<VmLock, LockError> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o640)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(VmLock { flock: Some(flock) }),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(LockError::AlreadyLocked),
            Err((_, errno)) => Err(LockError::Io(std::io::Error::from(errno))),
        }
    }

    /// Releases the lock and closes the file. A second call is a no-op.
    pub fn release(&mut self) {
        if let Some(flock) = self.flock.take() {
            if let Err((_, errno)) = flock.unlock() {
                warn!(error = %errno, "failed to release vm lock");
            }
        }
    }
}

impl Drop for VmLock {
    fn drop(&mut self) {
        self.release();
    }
}
