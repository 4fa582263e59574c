//! Release archiving
//!
//! Takes one filtered [`Snapshot`] of the source tree and writes it out in
//! each requested [`ArchiveFormat`]. Both formats are produced from the same
//! snapshot, so a path excluded from one is excluded from the other.
//!
//! Writing goes through an ordered list of [`ArchiveBackend`]s: system tools
//! first when available, the in-process routine last. A backend that fails
//! is skipped with a warning; only the last one's error is returned.

mod backend;
mod exclude;

pub use backend::{ArchiveBackend, ExternalTools, InProcess};
pub use exclude::{ExcludeError, ExcludeRules, DEFAULT_EXCLUDES, IGNORE_FILENAME};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::signal::TempRegistry;

/// Suffix of archives still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Archive format of one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// gzip-compressed tarball
    Tar,
    /// zip archive
    Zip,
}

impl ArchiveFormat {
    /// File extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which formats a run produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatSelection {
    TarOnly,
    ZipOnly,
    #[default]
    Both,
}

impl FormatSelection {
    /// Formats in production order
    pub fn formats(self) -> Vec<ArchiveFormat> {
        match self {
            FormatSelection::TarOnly => vec![ArchiveFormat::Tar],
            FormatSelection::ZipOnly => vec![ArchiveFormat::Zip],
            FormatSelection::Both => vec![ArchiveFormat::Tar, ArchiveFormat::Zip],
        }
    }
}

impl FromStr for FormatSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tar" | "tgz" | "tar.gz" | "tarball" => Ok(FormatSelection::TarOnly),
            "zip" => Ok(FormatSelection::ZipOnly),
            "both" | "all" => Ok(FormatSelection::Both),
            other => Err(format!(
                "invalid archive format '{}' (expected tar, zip or both)",
                other
            )),
        }
    }
}

/// Errors for archiving operations
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("source root unreadable: {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} cannot archive path {path:?}")]
    UnsupportedPath { tool: String, path: String },

    #[error("Path is not within source root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("no backend can write {0} archives")]
    NoBackend(ArchiveFormat),
}

impl BundleError {
    /// Whether this error means the source tree itself could not be read
    pub fn is_source_error(&self) -> bool {
        matches!(self, BundleError::SourceUnreadable { .. })
    }
}

/// Kind of a snapshot entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One path captured in a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Path relative to the snapshot root
    pub rel_path: PathBuf,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes at capture time (0 for directories)
    pub size: u64,
    /// Where to read contents from (the link target for in-root symlinks)
    pub source: PathBuf,
    /// Whether the file carries an executable bit
    pub executable: bool,
}

impl SnapshotEntry {
    /// Name inside the archive: `/`-separated, directories end with `/`
    pub fn archive_name(&self) -> String {
        let joined = self
            .rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        match self.kind {
            EntryKind::Directory => format!("{}/", joined),
            EntryKind::File => joined,
        }
    }
}

/// Filtered, sorted listing of a source tree taken once per run
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: PathBuf,
    entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Walk `root` and record every path not excluded by `rules`
    ///
    /// Excluded directories are pruned without descending into them.
    /// Symlinks to files inside the root are captured as regular files;
    /// symlinks to directories, escaping the root, or dangling are skipped.
    pub fn capture(root: &Path, rules: &ExcludeRules) -> Result<Self, BundleError> {
        let unreadable = |source: io::Error| BundleError::SourceUnreadable {
            path: root.to_path_buf(),
            source,
        };

        let root = root.canonicalize().map_err(unreadable)?;
        fs::read_dir(&root).map_err(unreadable)?;

        let mut entries = Vec::new();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !rules.skips(e.path()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
                BundleError::SourceUnreadable { path, source }
            })?;

            if entry.depth() == 0 {
                continue;
            }

            let path = entry.path();
            let rel_path = path
                .strip_prefix(&root)
                .map_err(|_| BundleError::PathNotInRoot(path.to_path_buf()))?
                .to_path_buf();
            let file_type = entry.file_type();

            let captured = if file_type.is_dir() {
                SnapshotEntry {
                    rel_path,
                    kind: EntryKind::Directory,
                    size: 0,
                    source: path.to_path_buf(),
                    executable: false,
                }
            } else if file_type.is_symlink() {
                match resolve_symlink(&root, path) {
                    Some((target, metadata)) => SnapshotEntry {
                        rel_path,
                        kind: EntryKind::File,
                        size: metadata.len(),
                        executable: is_executable(&metadata),
                        source: target,
                    },
                    None => continue,
                }
            } else if file_type.is_file() {
                let metadata = entry.metadata()?;
                SnapshotEntry {
                    rel_path,
                    kind: EntryKind::File,
                    size: metadata.len(),
                    executable: is_executable(&metadata),
                    source: path.to_path_buf(),
                }
            } else {
                debug!(path = %path.display(), "skipping special file");
                continue;
            };

            entries.push(captured);
        }

        Ok(Self { root, entries })
    }

    /// Canonical snapshot root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries in archive order
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Number of regular files captured
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }

    /// Sum of captured file sizes
    pub fn content_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Resolve an in-root symlink to a regular file
///
/// `root` must be canonical.
pub(crate) fn resolve_symlink(root: &Path, link: &Path) -> Option<(PathBuf, fs::Metadata)> {
    let target = match link.canonicalize() {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %link.display(), error = %e, "skipping dangling symlink");
            return None;
        }
    };

    if !target.starts_with(root) {
        warn!(path = %link.display(), target = %target.display(), "skipping symlink that escapes the source root");
        return None;
    }

    match fs::metadata(&target) {
        Ok(m) if m.is_file() => Some((target, m)),
        Ok(_) => {
            debug!(path = %link.display(), "skipping symlink to directory");
            None
        }
        Err(e) => {
            warn!(path = %link.display(), error = %e, "skipping unreadable symlink target");
            None
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// A written archive
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub format: ArchiveFormat,
    pub path: PathBuf,
    /// Backend that produced the file
    pub backend: &'static str,
}

/// Writes snapshots through an ordered chain of backends
pub struct Archiver {
    /// Preferred backends, tried before the in-process routine
    preferred: Vec<Box<dyn ArchiveBackend>>,
    fallback: InProcess,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    /// Archiver using only the in-process routine
    pub fn new() -> Self {
        Self {
            preferred: Vec::new(),
            fallback: InProcess,
        }
    }

    /// Prefer system `tar`/`zip` when they are installed
    pub fn with_system_tools(self) -> Self {
        let tools = ExternalTools::detect();
        if tools.is_empty() {
            debug!("no system archiving tools found, using in-process archiving");
            return self;
        }
        self.with_backend(Box::new(tools))
    }

    /// Add a preferred backend (tried in insertion order)
    pub fn with_backend(mut self, backend: Box<dyn ArchiveBackend>) -> Self {
        self.preferred.push(backend);
        self
    }

    /// Names of the backends that would be tried for `format`
    pub fn chain(&self, format: ArchiveFormat) -> Vec<&'static str> {
        self.backends(format).map(|b| b.name()).collect()
    }

    fn backends(&self, format: ArchiveFormat) -> impl Iterator<Item = &dyn ArchiveBackend> {
        self.preferred
            .iter()
            .map(|b| b.as_ref())
            .chain(std::iter::once(&self.fallback as &dyn ArchiveBackend))
            .filter(move |b| b.supports(format))
    }

    /// Write `snapshot` as `format` to `output`
    ///
    /// The archive is built at `<output>.partial` and renamed into place
    /// only once complete, so `output` never holds a truncated archive.
    pub fn write_archive(
        &self,
        snapshot: &Snapshot,
        format: ArchiveFormat,
        output: &Path,
        registry: &TempRegistry,
    ) -> Result<ArchiveOutcome, BundleError> {
        let output = absolute(output)?;
        let mut partial_name = output.as_os_str().to_owned();
        partial_name.push(PARTIAL_SUFFIX);
        let partial = registry.track(PathBuf::from(partial_name));

        let mut last_error = None;
        for backend in self.backends(format) {
            if let Err(e) = remove_stale(partial.path()) {
                last_error = Some(BundleError::from(e));
                break;
            }

            match backend.write(snapshot, format, partial.path()) {
                Ok(()) => {
                    fs::rename(partial.path(), &output)?;
                    partial.keep();
                    debug!(format = %format, backend = backend.name(), path = %output.display(), "archive written");
                    return Ok(ArchiveOutcome {
                        format,
                        path: output,
                        backend: backend.name(),
                    });
                }
                Err(e) => {
                    warn!(format = %format, backend = backend.name(), error = %e, "archiving backend failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(BundleError::NoBackend(format)))
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
