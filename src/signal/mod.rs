//! Temporary-path cleanup and signal handling (SIGINT/SIGTERM)
//!
//! Every temporary path a run creates (partial archives, pointer swap
//! files, the release slot before its manifest lands) is registered in a
//! [`TempRegistry`]. Registered paths are removed on every exit path:
//!
//! 1. Scoped: a [`TempPath`] guard removes its path when dropped unless
//!    [`TempPath::keep`] was called.
//! 2. Process exit: a [`CleanupGuard`] held by `main` sweeps whatever is
//!    still registered.
//! 3. Signals: the installed handler sweeps the registry, then either stops
//!    the foreground server or exits with [`EXIT_CODE_INTERRUPTED`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

/// Exit code when packaging is interrupted by a signal
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Set of temporary paths owned by the current invocation
#[derive(Debug, Default)]
pub struct TempRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl TempRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path for cleanup
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if let Ok(mut paths) = self.paths.lock() {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }

    /// Forget a path (it is no longer temporary)
    pub fn unregister(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.retain(|p| p != path);
        }
    }

    /// Paths currently registered
    pub fn registered(&self) -> Vec<PathBuf> {
        self.paths.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Register `path` and return a guard that removes it on drop
    pub fn track(&self, path: impl Into<PathBuf>) -> TempPath<'_> {
        let path = path.into();
        self.register(path.clone());
        TempPath {
            registry: self,
            path,
            keep: false,
        }
    }

    /// Remove every registered path, newest first
    ///
    /// Returns the number of paths that existed and were removed.
    pub fn cleanup(&self) -> usize {
        let paths = match self.paths.lock() {
            Ok(mut paths) => std::mem::take(&mut *paths),
            // Poisoned by a panicking holder; still sweep what it left.
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut removed = 0;
        for path in paths.iter().rev() {
            match remove_path(path) {
                Ok(true) => {
                    debug!(path = %path.display(), "removed temporary path");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temporary path"),
            }
        }
        removed
    }
}

/// Remove a file, symlink or directory tree; `Ok(false)` if it was absent
fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Scoped temporary path, removed on drop unless kept
#[derive(Debug)]
pub struct TempPath<'a> {
    registry: &'a TempRegistry,
    path: PathBuf,
    keep: bool,
}

impl TempPath<'_> {
    /// The guarded path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the path and stop tracking it
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.registry.unregister(&self.path);
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempPath<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        self.registry.unregister(&self.path);
        if let Err(e) = remove_path(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove temporary path");
        }
    }
}

/// Sweeps the registry when the invocation ends normally or by error
pub struct CleanupGuard {
    registry: Arc<TempRegistry>,
}

impl CleanupGuard {
    pub fn new(registry: Arc<TempRegistry>) -> Self {
        Self { registry }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.registry.cleanup();
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Foreground server running: stop it and exit cleanly
    StopServer,
    /// Packaging in progress, or a repeated signal: clean up and exit
    Abort,
}

/// Signal handler state shared with the handler thread
#[derive(Debug, Default)]
pub struct SignalState {
    /// Set once any signal arrives
    interrupted: AtomicBool,
    /// True while the foreground server loop is running
    serving: AtomicBool,
    /// Signals received so far
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a signal has been received
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Flag polled by the foreground server loop
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.interrupted
    }

    /// Mark the start or end of the serving phase
    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    /// Number of signals received
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what to do about it
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);

        if count == 0 && self.serving.load(Ordering::SeqCst) {
            SignalAction::StopServer
        } else {
            SignalAction::Abort
        }
    }
}

/// Installs the process-wide SIGINT/SIGTERM handler
pub struct SignalHandler {
    state: Arc<SignalState>,
    registry: Arc<TempRegistry>,
}

impl SignalHandler {
    pub fn new(registry: Arc<TempRegistry>) -> Self {
        Self {
            state: Arc::new(SignalState::new()),
            registry,
        }
    }

    /// Shared signal state
    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the handler; may only succeed once per process
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);

        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::StopServer => {
                info!("received interrupt, stopping server");
            }
            SignalAction::Abort => {
                let removed = registry.cleanup();
                warn!(removed, "interrupted, temporary files cleaned up");
                std::process::exit(EXIT_CODE_INTERRUPTED);
            }
        })
    }
}
