//! Release retention
//!
//! - Keeps the newest K releases besides the one just produced
//! - The current release is never a deletion candidate
//! - K = 0 disables pruning
//! - Ordering comes from release identifiers, not directory mtimes
//! - A slot that cannot be removed is reported and skipped

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::release::{list_releases, Release, ReleaseId};

/// Default number of prior releases kept
pub const DEFAULT_KEEP: usize = 5;

/// Retention policy for release slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Prior releases to keep (0 = unlimited)
    #[serde(default)]
    pub max_releases: usize,
    /// Log but don't delete
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::keep_last_n(DEFAULT_KEEP)
    }
}

impl RetentionPolicy {
    /// Count-based policy.
    pub fn keep_last_n(count: usize) -> Self {
        Self {
            max_releases: count,
            dry_run: false,
        }
    }

    /// No pruning at all.
    pub fn unlimited() -> Self {
        Self::keep_last_n(0)
    }

    /// Set dry-run mode.
    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_releases == 0
    }
}

/// Result of a pruning pass.
#[derive(Debug, Clone, Default)]
pub struct PruneResult {
    /// Release slots found
    pub scanned: usize,
    /// Releases removed (or that would be, in dry-run mode), oldest first
    pub deleted: Vec<ReleaseId>,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Removal failures (non-fatal)
    pub errors: Vec<String>,
}

/// Applies a [`RetentionPolicy`] to a `releases/` directory.
pub struct ReleasePruner {
    releases_dir: PathBuf,
    policy: RetentionPolicy,
}

impl ReleasePruner {
    pub fn new(releases_dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            releases_dir: releases_dir.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Releases the policy would remove, oldest first
    ///
    /// `current` is excluded from both the candidates and the K count.
    pub fn plan(&self, current: Option<&ReleaseId>) -> io::Result<Vec<Release>> {
        if self.policy.is_unlimited() {
            return Ok(Vec::new());
        }

        let mut prior: Vec<Release> = list_releases(&self.releases_dir)?
            .into_iter()
            .filter(|r| Some(&r.id) != current)
            .collect();

        let excess = prior.len().saturating_sub(self.policy.max_releases);
        prior.truncate(excess);
        Ok(prior)
    }

    /// Remove what [`plan`](Self::plan) selects.
    pub fn run(&self, current: Option<&ReleaseId>) -> io::Result<PruneResult> {
        let mut result = PruneResult {
            scanned: list_releases(&self.releases_dir)?.len(),
            ..PruneResult::default()
        };

        for release in self.plan(current)? {
            let size = dir_size(&release.path).unwrap_or(0);

            if self.policy.dry_run {
                info!(release = %release.id, bytes = size, "dry-run: would prune release");
            } else if let Err(e) = fs::remove_dir_all(&release.path) {
                warn!(release = %release.id, error = %e, "failed to prune release");
                result
                    .errors
                    .push(format!("failed to delete {}: {}", release.id, e));
                continue;
            } else {
                info!(release = %release.id, bytes = size, "pruned release");
            }

            result.bytes_reclaimed += size;
            result.deleted.push(release.id);
        }

        Ok(result)
    }

    /// Summary of what is currently stored.
    pub fn stats(&self) -> io::Result<ReleaseStats> {
        let releases = list_releases(&self.releases_dir)?;
        let total_size_bytes = releases
            .iter()
            .map(|r| dir_size(&r.path).unwrap_or(0))
            .sum();

        Ok(ReleaseStats {
            total_releases: releases.len(),
            total_size_bytes,
            oldest: releases.first().map(|r| r.id.clone()),
            newest: releases.last().map(|r| r.id.clone()),
        })
    }
}

/// Statistics about the releases directory.
#[derive(Debug, Clone)]
pub struct ReleaseStats {
    pub total_releases: usize,
    pub total_size_bytes: u64,
    pub oldest: Option<ReleaseId>,
    pub newest: Option<ReleaseId>,
}

/// Size of a directory tree; symlinks count as their own size.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += entry.metadata()?.len();
        }
    }
    Ok(size)
}
