//! Exclusion rules for release snapshots
//!
//! Patterns are matched against each path component on its own, never
//! against the full relative path, so `*.log` excludes `a/b/debug.log` and
//! `node_modules` excludes every directory of that name at any depth.
//!
//! The backup directory is the one exception: it is excluded by location,
//! so a source directory that only shares its name is still archived.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Default component patterns excluded from every release
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // version control metadata
    ".git",
    ".hg",
    ".svn",
    // dependency caches
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    // compiled bytecode
    "*.pyc",
    "*.pyo",
    // logs
    "*.log",
    // OS metadata
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

/// Name of the optional per-tree ignore file
pub const IGNORE_FILENAME: &str = ".relpackignore";

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Glob pattern error: {0}")]
    GlobError(#[from] globset::Error),

    #[error("Pattern must name a single path component: {0}")]
    NotAComponent(String),
}

/// Exclusion rules for filtering snapshot entries
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    glob_set: GlobSet,
    /// Absolute directories skipped wherever a walk meets them
    excluded_dirs: Vec<PathBuf>,
}

impl ExcludeRules {
    /// Create exclusion rules holding the default patterns
    pub fn new() -> Result<Self, ExcludeError> {
        Self::from_patterns(
            DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect(),
            Vec::new(),
        )
    }

    fn from_patterns(patterns: Vec<String>, excluded_dirs: Vec<PathBuf>) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            patterns,
            glob_set: builder.build()?,
            excluded_dirs,
        })
    }

    /// Exclude the pipeline's own backup directory by its location
    ///
    /// An existing directory is canonicalized so it compares equal to the
    /// paths of a walk over a canonical root.
    pub fn with_backup_dir(mut self, backup_root: &Path) -> Result<Self, ExcludeError> {
        let dir = match backup_root.canonicalize() {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if backup_root.is_absolute() {
                    backup_root.to_path_buf()
                } else {
                    std::env::current_dir()?.join(backup_root)
                }
            }
            Err(e) => return Err(e.into()),
        };

        if !self.excluded_dirs.contains(&dir) {
            self.excluded_dirs.push(dir);
        }
        Ok(self)
    }

    /// Add patterns from an ignore file (one per line, `#` starts a comment)
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path)?;
        let patterns: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        self.with_patterns(&patterns)
    }

    /// Add additional component patterns
    ///
    /// A trailing `/` is accepted and dropped; any other separator is
    /// rejected because rules never look at more than one component.
    pub fn with_patterns(self, extra: &[&str]) -> Result<Self, ExcludeError> {
        let mut patterns = self.patterns;

        for raw in extra {
            let pattern = raw.trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains('/') || pattern.contains('\\') {
                return Err(ExcludeError::NotAComponent(raw.to_string()));
            }
            if !patterns.iter().any(|p| p == pattern) {
                patterns.push(pattern.to_string());
            }
        }

        Self::from_patterns(patterns, self.excluded_dirs)
    }

    /// Check a single component name
    pub fn is_excluded_name(&self, name: &OsStr) -> bool {
        self.glob_set.is_match(Path::new(name))
    }

    /// Check whether any component of a relative path is excluded
    pub fn is_excluded(&self, rel_path: &Path) -> bool {
        rel_path.components().any(|c| match c {
            Component::Normal(name) => self.is_excluded_name(name),
            _ => false,
        })
    }

    /// Whether a tree walk should skip `path` entirely
    pub fn skips(&self, path: &Path) -> bool {
        path.file_name().is_some_and(|name| self.is_excluded_name(name))
            || self.excluded_dirs.iter().any(|dir| dir == path)
    }

    /// Active patterns, defaults first
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
