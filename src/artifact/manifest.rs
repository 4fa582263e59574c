//! Release manifest (`metadata.json`)
//!
//! Describes the artifacts of one release: per-artifact size and SHA-256
//! (or the error that prevented them), the aggregate archive size, and how
//! many files the source tree held when it was packaged.
//!
//! The manifest is derived, best-effort metadata. The artifacts on disk are
//! the source of truth; nothing reads the manifest to decide what exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::bundle::{resolve_symlink, ArchiveFormat, ExcludeRules};
use crate::release::Release;

/// Schema version for metadata.json
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the manifest inside each release slot
pub const MANIFEST_FILENAME: &str = "metadata.json";

/// Read size used while hashing; memory use does not grow with file size
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Errors for manifest operations
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Size and SHA-256 of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

/// Hash a file in fixed-size chunks
pub fn hash_file(path: &Path) -> io::Result<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok(FileDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Count files under `root`, honouring the snapshot exclusion rules
///
/// Walks the tree once and counts what [`Snapshot::capture`] would archive:
/// regular files plus symlinks to files inside the root. Excluded
/// directories (including the backup directory) are never entered.
/// Unreadable subtrees are skipped.
///
/// [`Snapshot::capture`]: crate::bundle::Snapshot::capture
pub fn count_source_files(root: &Path, rules: &ExcludeRules) -> u64 {
    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "source root unreadable while counting files");
            return 0;
        }
    };

    WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !rules.skips(e.path()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "skipping unreadable path while counting files");
                None
            }
        })
        .filter(|entry| {
            let file_type = entry.file_type();
            file_type.is_file()
                || (file_type.is_symlink() && resolve_symlink(&root, entry.path()).is_some())
        })
        .count() as u64
}

/// Manifest entry for one artifact
///
/// Exactly one of (`size` + `sha256`) or `error` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// Artifact file name within the release slot
    pub file: String,

    pub format: ArchiveFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Why the artifact could not be produced or hashed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactSummary {
    /// Hash an artifact on disk; a hashing failure becomes the error field
    pub fn from_file(path: &Path, format: ArchiveFormat) -> Self {
        let file = file_name(path);
        match hash_file(path) {
            Ok(digest) => Self {
                file,
                format,
                size: Some(digest.size),
                sha256: Some(digest.sha256),
                error: None,
            },
            Err(e) => Self::failed(file, format, format!("hashing failed: {}", e)),
        }
    }

    /// Entry for an artifact that was not produced
    pub fn failed(file: impl Into<String>, format: ArchiveFormat, error: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            format,
            size: None,
            sha256: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Release manifest (metadata.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub schema_version: u32,

    /// Release identifier
    pub timestamp: String,

    /// When the manifest was written
    pub created_at: DateTime<Utc>,

    /// Absolute path of the packaged tree
    pub source_root: String,

    /// One entry per requested format
    pub artifacts: Vec<ArtifactSummary>,

    /// Sum of the sizes of the artifacts that exist
    pub total_size: u64,

    /// Files in the source tree at packaging time
    pub file_count: u64,
}

impl ReleaseManifest {
    /// Assemble a manifest for `release`
    pub fn build(
        release: &Release,
        source_root: &Path,
        artifacts: Vec<ArtifactSummary>,
        file_count: u64,
    ) -> Self {
        let total_size = artifacts.iter().filter_map(|a| a.size).sum();

        Self {
            schema_version: SCHEMA_VERSION,
            timestamp: release.id.to_string(),
            created_at: Utc::now(),
            source_root: source_root.display().to_string(),
            artifacts,
            total_size,
            file_count,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    /// Entry for `format`, if that format was requested
    pub fn find(&self, format: ArchiveFormat) -> Option<&ArtifactSummary> {
        self.artifacts.iter().find(|a| a.format == format)
    }

    /// Write `metadata.json` into `dir` all-or-nothing
    ///
    /// The document goes to a hidden temp file first and is renamed into
    /// place, so readers never observe a partial manifest.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
        let json = self.to_json()?;
        let final_path = dir.join(MANIFEST_FILENAME);
        let temp_path = dir.join(format!(".{}.tmp", MANIFEST_FILENAME));

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &final_path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(final_path)
    }
}
