//! Generational rotation of the server log
//!
//! `server.log` becomes `server.log.1`, `server.log.1` becomes
//! `server.log.2`, and so on up to the configured number of generations;
//! whatever sat in the last generation is discarded. Renames run from the
//! oldest generation down so no generation overwrites a younger one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Generations kept when nothing else is configured
pub const DEFAULT_GENERATIONS: u32 = 5;

/// Rotates one log file through numbered generations
#[derive(Debug, Clone)]
pub struct LogRotator {
    path: PathBuf,
    generations: u32,
}

impl LogRotator {
    /// `generations` is clamped to at least 1.
    pub fn new(path: impl Into<PathBuf>, generations: u32) -> Self {
        Self {
            path: path.into(),
            generations: generations.max(1),
        }
    }

    /// The active log
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generations(&self) -> u32 {
        self.generations
    }

    /// Path of generation `n` (`n >= 1`)
    pub fn generation_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Shift every generation up by one and move the active log to `.1`
    ///
    /// Returns `false` without touching anything when there is no active log.
    pub fn rotate(&self) -> io::Result<bool> {
        if fs::symlink_metadata(&self.path).is_err() {
            return Ok(false);
        }

        let oldest = self.generation_path(self.generations);
        match fs::remove_file(&oldest) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }

        for n in (1..self.generations).rev() {
            let from = self.generation_path(n);
            if fs::symlink_metadata(&from).is_ok() {
                fs::rename(&from, self.generation_path(n + 1))?;
            }
        }

        fs::rename(&self.path, self.generation_path(1))?;
        debug!(log = %self.path.display(), generations = self.generations, "rotated server log");
        Ok(true)
    }
}
