//! Release identifiers and release slots
//!
//! A release is one packaging run stored as `releases/<id>/` under the
//! backup root. Identifiers are second-resolution local timestamps
//! (`YYYYMMDD-HHMMSS`); a run landing in an already-used second gets a
//! numeric suffix (`-1`, `-2`, ...). Slots are claimed with `create_dir`,
//! so two runs can never end up sharing one.

use chrono::{DateTime, Local, NaiveDateTime};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::artifact::MANIFEST_FILENAME;
use crate::bundle::ArchiveFormat;

/// Timestamp layout of release identifiers
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Directory under the backup root holding one subdirectory per release
pub const RELEASES_DIRNAME: &str = "releases";

const TIMESTAMP_LEN: usize = 15;

/// Collision suffixes tried before giving up on a second
const MAX_SUFFIX: u32 = 999;

/// Errors for release slot operations
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("invalid release identifier: {0}")]
    InvalidId(String),

    #[error("no free release slot for {0}")]
    Exhausted(String),
}

/// Release identifier, totally ordered by timestamp then suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseId {
    stamp: String,
    /// 0 means no suffix
    suffix: u32,
}

impl ReleaseId {
    /// Identifier for a moment in local time
    pub fn from_time(time: &DateTime<Local>) -> Self {
        Self {
            stamp: time.format(TIMESTAMP_FORMAT).to_string(),
            suffix: 0,
        }
    }

    /// Same second, different suffix
    pub fn with_suffix(&self, suffix: u32) -> Self {
        Self {
            stamp: self.stamp.clone(),
            suffix,
        }
    }

    /// Timestamp part
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Collision suffix (0 when absent)
    pub fn suffix(&self) -> u32 {
        self.suffix
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.suffix == 0 {
            f.write_str(&self.stamp)
        } else {
            write!(f, "{}-{}", self.stamp, self.suffix)
        }
    }
}

impl FromStr for ReleaseId {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReleaseError::InvalidId(s.to_string());

        if !s.is_ascii() || s.len() < TIMESTAMP_LEN {
            return Err(invalid());
        }
        let (stamp, rest) = s.split_at(TIMESTAMP_LEN);
        if NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_err() {
            return Err(invalid());
        }

        let suffix = if rest.is_empty() {
            0
        } else {
            let digits = rest.strip_prefix('-').ok_or_else(invalid)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            match digits.parse::<u32>() {
                // "-0" and leading zeros would not round-trip through Display
                Ok(n) if n > 0 && !digits.starts_with('0') => n,
                _ => return Err(invalid()),
            }
        };

        Ok(Self {
            stamp: stamp.to_string(),
            suffix,
        })
    }
}

impl Ord for ReleaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then(self.suffix.cmp(&other.suffix))
    }
}

impl PartialOrd for ReleaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A release slot on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: ReleaseId,
    pub path: PathBuf,
}

impl Release {
    /// Claim a fresh slot under `releases_dir` for `now`
    pub fn allocate(releases_dir: &Path, now: DateTime<Local>) -> Result<Self, ReleaseError> {
        fs::create_dir_all(releases_dir)?;

        let base = ReleaseId::from_time(&now);
        for suffix in 0..=MAX_SUFFIX {
            let id = base.with_suffix(suffix);
            let path = releases_dir.join(id.to_string());
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { id, path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ReleaseError::Exhausted(base.to_string()))
    }

    /// Path of the release's `metadata.json`
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILENAME)
    }

    /// File name of this release's artifact in `format`
    pub fn artifact_name(&self, project: &str, format: ArchiveFormat) -> String {
        format!("{}-{}.{}", project, self.id, format.extension())
    }

    /// Absolute path of this release's artifact in `format`
    pub fn artifact_path(&self, project: &str, format: ArchiveFormat) -> PathBuf {
        self.path.join(self.artifact_name(project, format))
    }
}

/// All release slots under `releases_dir`, oldest first
///
/// Entries whose names are not release identifiers are ignored.
pub fn list_releases(releases_dir: &Path) -> io::Result<Vec<Release>> {
    if !releases_dir.exists() {
        return Ok(Vec::new());
    }

    let mut releases = Vec::new();
    for entry in fs::read_dir(releases_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Ok(id) = name.parse::<ReleaseId>() {
            releases.push(Release {
                id,
                path: entry.path(),
            });
        }
    }

    releases.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(releases)
}

/// File-name-safe project name derived from the source root
pub fn project_name(source_root: &Path) -> String {
    let raw = source_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "release".to_string()
    } else {
        trimmed.to_string()
    }
}
