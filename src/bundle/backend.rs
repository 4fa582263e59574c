//! Archiving backends
//!
//! [`InProcess`] is always available and produces canonical archives
//! (sorted entries, zeroed timestamps and ownership, normalized modes) so
//! that identical trees hash identically. [`ExternalTools`] drives the
//! system `tar` and `zip` binaries with the snapshot's explicit file list.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tar::{Builder, Header};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{ArchiveFormat, BundleError, EntryKind, Snapshot, SnapshotEntry};

/// A way of writing a snapshot to an archive file
pub trait ArchiveBackend {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether this backend can produce `format` in this environment
    fn supports(&self, format: ArchiveFormat) -> bool;

    /// Write `snapshot` as `format` to `output` (overwriting it)
    fn write(
        &self,
        snapshot: &Snapshot,
        format: ArchiveFormat,
        output: &Path,
    ) -> Result<(), BundleError>;
}

/// In-process archiving using the `tar`, `flate2` and `zip` crates
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcess;

impl InProcess {
    fn write_tar_gz(&self, snapshot: &Snapshot, output: &Path) -> Result<(), BundleError> {
        let file = File::create(output)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = Builder::new(encoder);

        for entry in snapshot.entries() {
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            match entry.kind {
                EntryKind::Directory => {
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_entry_type(tar::EntryType::Directory);
                    builder.append_data(&mut header, entry.archive_name(), io::empty())?;
                }
                EntryKind::File => {
                    let source = File::open(&entry.source)?;
                    let len = source.metadata()?.len();
                    header.set_size(len);
                    header.set_mode(file_mode(entry));
                    header.set_entry_type(tar::EntryType::Regular);
                    builder.append_data(&mut header, &entry.rel_path, io::Read::take(source, len))?;
                }
            }
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    fn write_zip(&self, snapshot: &Snapshot, output: &Path) -> Result<(), BundleError> {
        let file = File::create(output)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        for entry in snapshot.entries() {
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(zip::DateTime::default());

            match entry.kind {
                EntryKind::Directory => {
                    zip.add_directory(entry.archive_name(), options.unix_permissions(0o755))?;
                }
                EntryKind::File => {
                    let mut source = File::open(&entry.source)?;
                    let options = options
                        .unix_permissions(file_mode(entry))
                        .large_file(entry.size >= u64::from(u32::MAX));
                    zip.start_file(entry.archive_name(), options)?;
                    io::copy(&mut source, &mut zip)?;
                }
            }
        }

        let mut writer = zip.finish()?;
        writer.flush()?;
        Ok(())
    }
}

impl ArchiveBackend for InProcess {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn supports(&self, _format: ArchiveFormat) -> bool {
        true
    }

    fn write(
        &self,
        snapshot: &Snapshot,
        format: ArchiveFormat,
        output: &Path,
    ) -> Result<(), BundleError> {
        match format {
            ArchiveFormat::Tar => self.write_tar_gz(snapshot, output),
            ArchiveFormat::Zip => self.write_zip(snapshot, output),
        }
    }
}

/// Preserve the executable bit, normalize everything else
fn file_mode(entry: &SnapshotEntry) -> u32 {
    if entry.executable {
        0o755
    } else {
        0o644
    }
}

/// System `tar` / `zip` binaries found on `PATH`
#[derive(Debug, Clone, Default)]
pub struct ExternalTools {
    tar: Option<PathBuf>,
    zip: Option<PathBuf>,
}

impl ExternalTools {
    /// Look up `tar` and `zip` on `PATH`
    pub fn detect() -> Self {
        Self {
            tar: which::which("tar").ok(),
            zip: which::which("zip").ok(),
        }
    }

    /// Use explicit binaries
    pub fn with_paths(tar: Option<PathBuf>, zip: Option<PathBuf>) -> Self {
        Self { tar, zip }
    }

    /// True when neither tool is available
    pub fn is_empty(&self) -> bool {
        self.tar.is_none() && self.zip.is_none()
    }

    /// Newline-separated member list fed to the tool on stdin
    ///
    /// Both tools read one name per line and `tar -T` treats a leading `-`
    /// as an option, so such names are refused and left to the in-process
    /// routine.
    fn file_list(tool: &str, snapshot: &Snapshot) -> Result<Vec<u8>, BundleError> {
        let mut list = Vec::new();
        for entry in snapshot.entries() {
            let name = entry.rel_path.to_string_lossy();
            if name.contains('\n') || name.starts_with('-') || name.contains('\u{FFFD}') {
                return Err(BundleError::UnsupportedPath {
                    tool: tool.to_string(),
                    path: name.into_owned(),
                });
            }
            list.extend_from_slice(name.as_bytes());
            list.push(b'\n');
        }
        Ok(list)
    }

    fn run(mut command: Command, tool: &str, stdin: &[u8]) -> Result<(), BundleError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)?;
        }

        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BundleError::ToolFailed {
                tool: tool.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl ArchiveBackend for ExternalTools {
    fn name(&self) -> &'static str {
        "system"
    }

    fn supports(&self, format: ArchiveFormat) -> bool {
        match format {
            ArchiveFormat::Tar => self.tar.is_some(),
            ArchiveFormat::Zip => self.zip.is_some(),
        }
    }

    fn write(
        &self,
        snapshot: &Snapshot,
        format: ArchiveFormat,
        output: &Path,
    ) -> Result<(), BundleError> {
        match format {
            ArchiveFormat::Tar => {
                let tar = self.tar.as_ref().ok_or(BundleError::NoBackend(format))?;
                let list = Self::file_list("tar", snapshot)?;
                let mut command = Command::new(tar);
                // -h stores in-root symlinks as the files they point at,
                // matching the snapshot; escaping links were never listed.
                command
                    .arg("-czhf")
                    .arg(output)
                    .arg("-C")
                    .arg(snapshot.root())
                    .arg("--no-recursion")
                    .arg("-T")
                    .arg("-");
                Self::run(command, "tar", &list)
            }
            ArchiveFormat::Zip => {
                let zip = self.zip.as_ref().ok_or(BundleError::NoBackend(format))?;
                let list = Self::file_list("zip", snapshot)?;
                let mut command = Command::new(zip);
                command
                    .current_dir(snapshot.root())
                    .arg("-q")
                    .arg("-X")
                    .arg(output)
                    .arg("-@");
                Self::run(command, "zip", &list)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ExcludeRules;
    use std::fs;
    use tempfile::TempDir;

    fn snapshot_of(files: &[(&str, &str)]) -> (TempDir, Snapshot) {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        let snapshot = Snapshot::capture(dir.path(), &ExcludeRules::new().unwrap()).unwrap();
        (dir, snapshot)
    }

    #[test]
    fn test_canonical_tar_headers() {
        use flate2::read::GzDecoder;

        let (_src, snapshot) = snapshot_of(&[("a.txt", "a"), ("dir/b.txt", "bb")]);
        let out = TempDir::new().unwrap();
        let path = out.path().join("x.tar.gz");
        InProcess.write(&snapshot, ArchiveFormat::Tar, &path).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path).unwrap()));
        let mut count = 0;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            let mode = header.mode().unwrap();
            match header.entry_type() {
                tar::EntryType::Regular => assert_eq!(mode, 0o644),
                tar::EntryType::Directory => assert_eq!(mode, 0o755),
                other => panic!("unexpected entry type {:?}", other),
            }
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_long_paths_survive_tar() {
        let long = format!("{}/file.txt", "nested".repeat(20));
        let (_src, snapshot) = snapshot_of(&[(long.as_str(), "deep")]);
        let out = TempDir::new().unwrap();
        let path = out.path().join("x.tar.gz");
        InProcess.write(&snapshot, ArchiveFormat::Tar, &path).unwrap();

        let mut archive =
            tar::Archive::new(flate2::read::GzDecoder::new(File::open(&path).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&long));
    }

    #[test]
    fn test_external_tools_support_follows_availability() {
        let none = ExternalTools::with_paths(None, None);
        assert!(none.is_empty());
        assert!(!none.supports(ArchiveFormat::Tar));
        assert!(!none.supports(ArchiveFormat::Zip));

        let tar_only = ExternalTools::with_paths(Some(PathBuf::from("/bin/tar")), None);
        assert!(tar_only.supports(ArchiveFormat::Tar));
        assert!(!tar_only.supports(ArchiveFormat::Zip));
    }

    #[test]
    fn test_file_list_refuses_option_like_names() {
        let (_src, snapshot) = snapshot_of(&[("-rf", "x")]);
        let err = ExternalTools::file_list("tar", &snapshot).unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedPath { .. }));
    }

    #[test]
    fn test_missing_binary_is_an_error_not_a_panic() {
        let (_src, snapshot) = snapshot_of(&[("a.txt", "a")]);
        let out = TempDir::new().unwrap();
        let tools = ExternalTools::with_paths(
            Some(PathBuf::from("/nonexistent/bin/tar")),
            Some(PathBuf::from("/nonexistent/bin/zip")),
        );

        assert!(tools
            .write(&snapshot, ArchiveFormat::Tar, &out.path().join("x.tar.gz"))
            .is_err());
        assert!(tools
            .write(&snapshot, ArchiveFormat::Zip, &out.path().join("x.zip"))
            .is_err());
    }
}
