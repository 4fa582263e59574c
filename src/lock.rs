//! Run lock for a backup root
//!
//! Packaging runs against one backup root are serialized with an advisory
//! exclusive lock on `<backup_root>/.relpack.lock`. A second run does not
//! wait: it fails fast so the caller can report the contention. The holder's
//! PID is written into the lock file for diagnostics only.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock {0}")]
    Held(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive lock over a backup root, released on drop.
#[derive(Debug)]
pub struct RunLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl RunLock {
    /// Lock file name
    pub const LOCK_FILENAME: &'static str = ".relpack.lock";

    /// Take the lock without waiting.
    ///
    /// Creates `dir` if needed.
    pub fn try_acquire(dir: &Path) -> LockResult<Self> {
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(Self::LOCK_FILENAME);

        // No truncate here: the current holder's PID must survive a failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if let Err(e) = file.try_lock_exclusive() {
            return if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                Err(LockError::Held(lock_path))
            } else {
                Err(LockError::Io(e))
            };
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = %lock_path.display(), "acquired run lock");

        Ok(Self {
            lock_path,
            lock_file: file,
        })
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}
