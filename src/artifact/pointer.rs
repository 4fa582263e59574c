//! Stable "latest" pointers, one per archive format
//!
//! `latest.tar.gz` and `latest.zip` live at the top of the backup root and
//! always name the newest artifact of their format. A pointer is a relative
//! symlink where the filesystem allows it and a full copy where it does not
//! (shared storage on phones, some FUSE mounts). Either way the new pointer
//! is built beside the old one and renamed over it, so readers see the old
//! pointer or the new one, never a missing or half-written file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::bundle::ArchiveFormat;

/// File name prefix of the pointers
pub const POINTER_PREFIX: &str = "latest";

/// How pointers may be materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerMode {
    /// Symlink, falling back to a copy when symlinks are refused
    #[default]
    Auto,
    /// Always copy
    Copy,
}

impl FromStr for PointerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "symlink" => Ok(PointerMode::Auto),
            "copy" => Ok(PointerMode::Copy),
            other => Err(format!("invalid pointer mode '{}' (expected auto or copy)", other)),
        }
    }
}

/// How a pointer ended up materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Symlink,
    Copy,
}

impl fmt::Display for PointerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerKind::Symlink => f.write_str("symlink"),
            PointerKind::Copy => f.write_str("copy"),
        }
    }
}

/// Errors for pointer updates
#[derive(Debug, thiserror::Error)]
pub enum PointerError {
    #[error("artifact does not exist: {0}")]
    MissingArtifact(PathBuf),

    #[error("could not update {pointer}: symlink: {symlink}; copy: {copy}")]
    Unavailable {
        pointer: PathBuf,
        symlink: String,
        copy: io::Error,
    },
}

/// The per-format latest pointers under one backup root
#[derive(Debug, Clone)]
pub struct LatestPointers {
    backup_root: PathBuf,
    mode: PointerMode,
}

impl LatestPointers {
    pub fn new(backup_root: impl Into<PathBuf>, mode: PointerMode) -> Self {
        Self {
            backup_root: backup_root.into(),
            mode,
        }
    }

    /// Directory holding the pointers
    pub fn root(&self) -> &Path {
        &self.backup_root
    }

    /// Pointer file name for `format`
    pub fn file_name(format: ArchiveFormat) -> String {
        format!("{}.{}", POINTER_PREFIX, format.extension())
    }

    /// Pointer path for `format`
    pub fn location(&self, format: ArchiveFormat) -> PathBuf {
        self.backup_root.join(Self::file_name(format))
    }

    fn swap_path(&self, format: ArchiveFormat) -> PathBuf {
        self.backup_root
            .join(format!(".{}.swap", Self::file_name(format)))
    }

    /// Point `format`'s pointer at `artifact`
    ///
    /// Repeating the call with the same artifact leaves the pointer in the
    /// same state. The artifact must exist: pointers are never made for
    /// artifacts that are not on disk.
    pub fn update(&self, format: ArchiveFormat, artifact: &Path) -> Result<PointerKind, PointerError> {
        if !artifact.is_file() {
            return Err(PointerError::MissingArtifact(artifact.to_path_buf()));
        }

        let location = self.location(format);
        let swap = self.swap_path(format);

        let symlink_error = match self.mode {
            PointerMode::Auto => match self.swap_symlink(artifact, &swap, &location) {
                Ok(()) => return Ok(PointerKind::Symlink),
                Err(e) => {
                    debug!(pointer = %location.display(), error = %e, "symlink pointer refused, copying instead");
                    e.to_string()
                }
            },
            PointerMode::Copy => "disabled by pointer mode".to_string(),
        };

        match swap_copy(artifact, &swap, &location) {
            Ok(()) => Ok(PointerKind::Copy),
            Err(copy) => Err(PointerError::Unavailable {
                pointer: location,
                symlink: symlink_error,
                copy,
            }),
        }
    }

    fn swap_symlink(&self, artifact: &Path, swap: &Path, location: &Path) -> io::Result<()> {
        // Relative targets keep the backup root relocatable.
        let target = artifact
            .strip_prefix(&self.backup_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| artifact.to_path_buf());

        remove_if_present(swap)?;
        let result = make_symlink(&target, swap).and_then(|()| fs::rename(swap, location));
        if result.is_err() {
            let _ = remove_if_present(swap);
        }
        result
    }

    /// Pointer path for `format` if it currently resolves to a file
    ///
    /// A symlink whose artifact was pruned does not resolve.
    pub fn resolve(&self, format: ArchiveFormat) -> Option<PathBuf> {
        let location = self.location(format);
        match fs::metadata(&location) {
            Ok(m) if m.is_file() => Some(location),
            _ => None,
        }
    }

    /// What the pointer currently refers to: the link target for a
    /// symlink pointer, the pointer itself for a copy
    pub fn target(&self, format: ArchiveFormat) -> Option<PathBuf> {
        let location = self.location(format);
        let metadata = fs::symlink_metadata(&location).ok()?;
        if metadata.file_type().is_symlink() {
            let link = fs::read_link(&location).ok()?;
            Some(if link.is_absolute() {
                link
            } else {
                self.backup_root.join(link)
            })
        } else {
            Some(location)
        }
    }
}

fn swap_copy(artifact: &Path, swap: &Path, location: &Path) -> io::Result<()> {
    remove_if_present(swap)?;
    // rename replaces an old symlink pointer itself, never its target
    let result = fs::copy(artifact, swap).and_then(|_| fs::rename(swap, location));
    if result.is_err() {
        let _ = remove_if_present(swap);
    }
    result
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink pointers need a unix filesystem",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(root: &Path, id: &str, ext: &str, body: &str) -> PathBuf {
        let dir = root.join("releases").join(id);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("proj-{}.{}", id, ext));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_pointer_file_names() {
        assert_eq!(LatestPointers::file_name(ArchiveFormat::Tar), "latest.tar.gz");
        assert_eq!(LatestPointers::file_name(ArchiveFormat::Zip), "latest.zip");
    }

    #[cfg(unix)]
    #[test]
    fn test_auto_mode_creates_relative_symlink() {
        let dir = TempDir::new().unwrap();
        let tar = artifact(dir.path(), "20260101-000000", "tar.gz", "v1");
        let pointers = LatestPointers::new(dir.path(), PointerMode::Auto);

        let kind = pointers.update(ArchiveFormat::Tar, &tar).unwrap();

        assert_eq!(kind, PointerKind::Symlink);
        let link = fs::read_link(pointers.location(ArchiveFormat::Tar)).unwrap();
        assert!(link.is_relative());
        assert_eq!(pointers.target(ArchiveFormat::Tar).unwrap(), tar);
        assert_eq!(fs::read_to_string(pointers.resolve(ArchiveFormat::Tar).unwrap()).unwrap(), "v1");
    }

    #[test]
    fn test_copy_mode_writes_bytes() {
        let dir = TempDir::new().unwrap();
        let zip = artifact(dir.path(), "20260101-000000", "zip", "zip-bytes");
        let pointers = LatestPointers::new(dir.path(), PointerMode::Copy);

        assert_eq!(pointers.update(ArchiveFormat::Zip, &zip).unwrap(), PointerKind::Copy);

        let location = pointers.location(ArchiveFormat::Zip);
        assert!(!fs::symlink_metadata(&location).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&location).unwrap(), "zip-bytes");
        assert_eq!(pointers.target(ArchiveFormat::Zip).unwrap(), location);
    }

    #[test]
    fn test_update_is_idempotent() {
        for mode in [PointerMode::Auto, PointerMode::Copy] {
            let dir = TempDir::new().unwrap();
            let tar = artifact(dir.path(), "20260101-000000", "tar.gz", "same");
            let pointers = LatestPointers::new(dir.path(), mode);

            let first = pointers.update(ArchiveFormat::Tar, &tar).unwrap();
            let bytes_first = fs::read(pointers.location(ArchiveFormat::Tar)).unwrap();
            let second = pointers.update(ArchiveFormat::Tar, &tar).unwrap();
            let bytes_second = fs::read(pointers.location(ArchiveFormat::Tar)).unwrap();

            assert_eq!(first, second);
            assert_eq!(bytes_first, bytes_second);
            assert!(!dir.path().join(".latest.tar.gz.swap").exists());
        }
    }

    #[test]
    fn test_copy_over_old_symlink_leaves_old_artifact_intact() {
        let dir = TempDir::new().unwrap();
        let old = artifact(dir.path(), "20260101-000000", "zip", "old");
        let new = artifact(dir.path(), "20260102-000000", "zip", "new");

        LatestPointers::new(dir.path(), PointerMode::Auto)
            .update(ArchiveFormat::Zip, &old)
            .unwrap();
        let pointers = LatestPointers::new(dir.path(), PointerMode::Copy);
        pointers.update(ArchiveFormat::Zip, &new).unwrap();

        assert_eq!(fs::read_to_string(&old).unwrap(), "old");
        assert_eq!(
            fs::read_to_string(pointers.location(ArchiveFormat::Zip)).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_missing_artifact_never_gets_a_pointer() {
        let dir = TempDir::new().unwrap();
        let pointers = LatestPointers::new(dir.path(), PointerMode::Auto);

        let err = pointers
            .update(ArchiveFormat::Tar, &dir.path().join("nope.tar.gz"))
            .unwrap_err();

        assert!(matches!(err, PointerError::MissingArtifact(_)));
        assert!(pointers.resolve(ArchiveFormat::Tar).is_none());
    }

    #[test]
    fn test_unwritable_root_reports_unavailable() {
        let dir = TempDir::new().unwrap();
        let zip = artifact(dir.path(), "20260101-000000", "zip", "z");
        let pointers = LatestPointers::new(dir.path().join("missing-root"), PointerMode::Auto);

        let err = pointers.update(ArchiveFormat::Zip, &zip).unwrap_err();
        assert!(matches!(err, PointerError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_does_not_resolve() {
        let dir = TempDir::new().unwrap();
        let tar = artifact(dir.path(), "20260101-000000", "tar.gz", "t");
        let pointers = LatestPointers::new(dir.path(), PointerMode::Auto);
        pointers.update(ArchiveFormat::Tar, &tar).unwrap();

        fs::remove_dir_all(dir.path().join("releases")).unwrap();

        assert!(pointers.resolve(ArchiveFormat::Tar).is_none());
        assert!(pointers.target(ArchiveFormat::Tar).is_some());
    }
}
