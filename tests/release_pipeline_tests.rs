//! End-to-end packaging runs against temporary source trees
//!
//! Every run uses the built-in archivers so results do not depend on the
//! host's tar/zip installation.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use relpack::artifact::{PointerMode, PruneResult, ReleaseManifest, MANIFEST_FILENAME};
use relpack::bundle::{ArchiveBackend, ArchiveFormat, Archiver, BundleError, FormatSelection, InProcess, Snapshot};
use relpack::config::{ConfigFile, EffectiveConfig, Settings};
use relpack::lock::RunLock;
use relpack::pipeline::{FormatReport, Pipeline, PipelineConfig, PipelineError, RunReport};
use relpack::release::{list_releases, Release};
use relpack::serve::StaticServer;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn sha256_hex(path: &Path) -> String {
    hex::encode(Sha256::digest(fs::read(path).unwrap()))
}

/// index.html, css/site.css, js/app.js plus noise that must not ship
fn create_site(dir: &Path) {
    fs::write(dir.join("index.html"), "<html>release</html>").unwrap();
    fs::create_dir_all(dir.join("css")).unwrap();
    fs::write(dir.join("css/site.css"), "body { margin: 0 }").unwrap();
    fs::create_dir_all(dir.join("js")).unwrap();
    fs::write(dir.join("js/app.js"), "console.log('hi');").unwrap();

    fs::write(dir.join("debug.log"), "noise").unwrap();
    fs::create_dir_all(dir.join(".git/objects")).unwrap();
    fs::write(dir.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
    fs::create_dir_all(dir.join("node_modules/dep")).unwrap();
    fs::write(dir.join("node_modules/dep/index.js"), "module.exports = 1").unwrap();
}

fn config(source: &Path, formats: FormatSelection) -> PipelineConfig {
    let mut config = PipelineConfig::new(source);
    config.formats = formats;
    config.external_tools = false;
    config.pointer_mode = PointerMode::Copy;
    config
}

fn tar_files(path: &Path) -> BTreeSet<String> {
    let decoder = flate2::read::GzDecoder::new(File::open(path).unwrap());
    let mut archive = tar::Archive::new(decoder);
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.header().entry_type().is_file())
        .map(|entry| entry.path().unwrap().to_string_lossy().into_owned())
        .collect()
}

fn zip_files(path: &Path) -> BTreeSet<String> {
    let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    archive
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect()
}

/// Writes a valid archive, then occupies its final path so the rename fails
struct OccupiedOutput {
    format: ArchiveFormat,
}

impl ArchiveBackend for OccupiedOutput {
    fn name(&self) -> &'static str {
        "occupied-output"
    }

    fn supports(&self, format: ArchiveFormat) -> bool {
        format == self.format
    }

    fn write(&self, snapshot: &Snapshot, format: ArchiveFormat, output: &Path) -> Result<(), BundleError> {
        let partial_name = output.file_name().unwrap().to_string_lossy().into_owned();
        let final_path = output.with_file_name(partial_name.trim_end_matches(".partial"));
        fs::create_dir_all(final_path.join("occupied"))?;
        InProcess.write(snapshot, format, output)
    }
}

fn expected_files() -> BTreeSet<String> {
    ["css/site.css", "index.html", "js/app.js"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn seed_prior_release(releases_dir: &Path, id: &str) -> PathBuf {
    let path = releases_dir.join(id);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join(format!("site-{}.tar.gz", id)), "old").unwrap();
    path
}

#[test]
fn test_both_formats_with_verified_manifest() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::Both));

    let report = pipeline.package().unwrap();

    let manifest_path = report.release.path.join(MANIFEST_FILENAME);
    let manifest = ReleaseManifest::from_file(&manifest_path).unwrap();
    assert_eq!(manifest.timestamp, report.release.id.to_string());
    assert_eq!(manifest.artifacts.len(), 2);

    let mut total = 0;
    for summary in &manifest.artifacts {
        let artifact = report.release.path.join(&summary.file);
        assert_eq!(summary.sha256.as_deref(), Some(sha256_hex(&artifact).as_str()));
        let size = fs::metadata(&artifact).unwrap().len();
        assert_eq!(summary.size, Some(size));
        total += size;
    }
    assert_eq!(manifest.total_size, total);
    assert_eq!(manifest.file_count, 3);
}

#[test]
fn test_archives_honour_exclusions() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::Both));

    let report = pipeline.package().unwrap();

    let artifacts: Vec<_> = report.artifacts().collect();
    let tar = artifacts.iter().find(|a| a.format == ArchiveFormat::Tar).unwrap();
    let zip = artifacts.iter().find(|a| a.format == ArchiveFormat::Zip).unwrap();

    assert_eq!(tar_files(&tar.path), expected_files());
    assert_eq!(zip_files(&zip.path), expected_files());
}

#[test]
fn test_retention_keeps_newest_prior_release() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let mut cfg = config(src.path(), FormatSelection::Both);
    cfg.keep = 1;
    let releases_dir = cfg.releases_dir();
    let oldest = seed_prior_release(&releases_dir, "20200101-000000");
    let newer = seed_prior_release(&releases_dir, "20200102-000000");
    let pipeline = Pipeline::new(cfg);

    let report = pipeline.package().unwrap();

    assert!(!oldest.exists());
    assert!(newer.exists());
    let remaining: Vec<String> = list_releases(&releases_dir)
        .unwrap()
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(
        remaining,
        vec!["20200102-000000".to_string(), report.release.id.to_string()]
    );
    assert_eq!(report.pruned.deleted.len(), 1);
    assert_eq!(report.manifest.as_ref().unwrap().file_count, 3);

    for artifact in report.artifacts() {
        let pointer = pipeline.pointers().resolve(artifact.format).unwrap();
        assert_eq!(fs::read(&pointer).unwrap(), fs::read(&artifact.path).unwrap());
    }
}

#[test]
fn test_unlimited_retention_prunes_nothing() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let mut cfg = config(src.path(), FormatSelection::TarOnly);
    cfg.keep = 0;
    for id in ["20200101-000000", "20200102-000000", "20200103-000000"] {
        seed_prior_release(&cfg.releases_dir(), id);
    }
    let releases_dir = cfg.releases_dir();

    let report = Pipeline::new(cfg).package().unwrap();

    assert!(report.pruned.deleted.is_empty());
    assert_eq!(list_releases(&releases_dir).unwrap().len(), 4);
}

#[test]
fn test_zip_only_run_serves_zip() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::ZipOnly));

    let report = pipeline.package().unwrap();
    let target = pipeline.select_target(&report).unwrap();

    assert_eq!(target.format, ArchiveFormat::Zip);
    assert_eq!(target.file_name, "latest.zip");
    assert_eq!(
        target.url("192.168.1.20", 8000),
        "http://192.168.1.20:8000/latest.zip"
    );
}

#[test]
fn test_no_fresh_artifact_exits_3() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::Both));
    // leaves valid but stale pointers behind
    pipeline.package().unwrap();

    let releases_dir = pipeline.config().releases_dir();
    let release = Release::allocate(&releases_dir, chrono::Local::now()).unwrap();
    let failed = |format| FormatReport {
        format,
        artifact: None,
        archive_error: Some("disk full".to_string()),
        pointer: None,
        pointer_error: None,
    };
    let report = RunReport {
        release,
        project: "site".to_string(),
        formats: vec![failed(ArchiveFormat::Tar), failed(ArchiveFormat::Zip)],
        manifest: None,
        pruned: PruneResult::default(),
        warnings: Vec::new(),
    };

    let err = pipeline.select_target(&report).unwrap_err();
    assert!(matches!(err, PipelineError::NoArtifact(_)));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_concurrent_run_is_rejected() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let cfg = config(src.path(), FormatSelection::Both);
    let _held = RunLock::try_acquire(&cfg.backup_root).unwrap();

    let err = Pipeline::new(cfg.clone()).package().unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert!(list_releases(&cfg.releases_dir()).unwrap().is_empty());
}

#[test]
fn test_invalid_port_falls_back_to_default() {
    let src = TempDir::new().unwrap();
    let cli = json!({"port": "eighty", "keep": "2"});
    let effective = EffectiveConfig::build(ConfigFile::None, Some(cli)).unwrap();

    let settings = Settings::resolve(src.path(), &effective).unwrap();
    let cfg = PipelineConfig::from_settings(&settings);

    assert_eq!(cfg.port, 8000);
    assert_eq!(cfg.keep, 2);
    assert_eq!(settings.warnings.len(), 1);
}

#[test]
fn test_config_file_feeds_the_pipeline() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    fs::write(src.path().join("drafts.md"), "wip").unwrap();
    let config_path = src.path().join("relpack.toml");
    let mut file = File::create(&config_path).unwrap();
    writeln!(file, "format = \"tar\"").unwrap();
    writeln!(file, "backup_dir = \"out/releases\"").unwrap();
    writeln!(file, "external_tools = false").unwrap();
    writeln!(file, "pointer_mode = \"copy\"").unwrap();
    writeln!(file, "exclude = [\"drafts.md\", \"relpack.toml\"]").unwrap();
    drop(file);

    let effective = EffectiveConfig::build(ConfigFile::Optional(&config_path), None).unwrap();
    let settings = Settings::resolve(src.path(), &effective).unwrap();
    let pipeline = Pipeline::new(PipelineConfig::from_settings(&settings));

    let report = pipeline.package().unwrap();

    let artifacts: Vec<_> = report.artifacts().collect();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].path.starts_with(src.path().join("out/releases")));
    assert_eq!(tar_files(&artifacts[0].path), expected_files());
}

#[test]
fn test_served_bytes_match_the_latest_artifact() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::TarOnly));
    let report = pipeline.package().unwrap();
    let target = pipeline.select_target(&report).unwrap();
    let expected = fs::read(&report.artifacts().next().unwrap().path).unwrap();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut server = StaticServer::bind(addr, &target.root, None).unwrap();
    let local = server.local_addr();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_server = Arc::clone(&stop);
    let handle = thread::spawn(move || server.serve_until(&stop_server));

    let mut stream = TcpStream::connect(local).unwrap();
    write!(
        stream,
        "GET /{} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        target.file_name
    )
    .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    handle.join().unwrap().unwrap();

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap()
        + 4;
    assert!(response.starts_with(b"HTTP/1.1 200"));
    assert_eq!(&response[header_end..], expected.as_slice());
}

#[test]
fn test_one_failed_format_is_recorded_and_the_other_is_served() {
    let src = TempDir::new().unwrap();
    create_site(src.path());
    let archiver = Archiver::new().with_backend(Box::new(OccupiedOutput {
        format: ArchiveFormat::Tar,
    }));
    let pipeline = Pipeline::new(config(src.path(), FormatSelection::Both)).with_archiver(archiver);

    let report = pipeline.package().unwrap();

    let tar = report.formats.iter().find(|f| f.format == ArchiveFormat::Tar).unwrap();
    assert!(tar.artifact.is_none());
    assert!(tar.archive_error.is_some());
    assert!(tar.pointer.is_none());
    assert!(report.warnings.iter().any(|w| w.starts_with("tar archive")));
    assert!(pipeline.pointers().resolve(ArchiveFormat::Tar).is_none());

    let manifest = ReleaseManifest::from_file(&report.release.path.join(MANIFEST_FILENAME)).unwrap();
    let tar_entry = manifest.find(ArchiveFormat::Tar).unwrap();
    assert!(tar_entry.error.is_some());
    assert_eq!(tar_entry.size, None);
    assert_eq!(tar_entry.sha256, None);
    let zip_entry = manifest.find(ArchiveFormat::Zip).unwrap();
    let zip_path = report.release.path.join(&zip_entry.file);
    assert!(zip_entry.is_ok());
    assert_eq!(manifest.total_size, fs::metadata(&zip_path).unwrap().len());
    assert_eq!(manifest.file_count, 3);

    let target = pipeline.select_target(&report).unwrap();
    assert_eq!(target.format, ArchiveFormat::Zip);
    assert_eq!(zip_files(&zip_path), expected_files());
}

#[test]
fn test_external_backup_root_does_not_hide_same_named_source_dir() {
    let scratch = TempDir::new().unwrap();
    let source = scratch.path().join("project");
    fs::create_dir_all(source.join("site")).unwrap();
    fs::write(source.join("index.html"), "<html></html>").unwrap();
    fs::write(source.join("site/page.html"), "<p>page</p>").unwrap();
    let mut cfg = config(&source, FormatSelection::ZipOnly);
    cfg.backup_root = scratch.path().join("site");

    let report = Pipeline::new(cfg).package().unwrap();

    let zip = report.artifacts().next().unwrap();
    let expected: BTreeSet<String> = ["index.html", "site/page.html"]
        .into_iter()
        .map(str::to_string)
        .collect();
    assert_eq!(zip_files(&zip.path), expected);
    assert_eq!(report.manifest.as_ref().unwrap().file_count, 2);
}
