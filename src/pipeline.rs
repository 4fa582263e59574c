//! Release orchestration
//!
//! One invocation packages the source tree into a new release and then
//! hands the newest artifact to a file server:
//! - Lock the backup root and run the optional pre-package hook
//! - Snapshot the source tree (an unreadable root aborts here)
//! - Claim a release slot and archive each requested format
//! - Hash the artifacts and write the manifest
//! - Point `latest.*` at the new artifacts
//! - Prune old releases
//! - Select the serving target, rotate the server log, start the server
//!
//! Steps run strictly in that order. Per-format failures are recorded in
//! the manifest and the [`RunReport`]; only the failures listed on
//! [`PipelineError`] end a run.

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{
    count_source_files, ArtifactSummary, LatestPointers, ManifestError, PointerKind, PointerMode,
    PruneResult, ReleaseManifest, ReleasePruner, ReleaseStats, RetentionPolicy, DEFAULT_KEEP,
};
use crate::bundle::{
    ArchiveFormat, ArchiveOutcome, Archiver, BundleError, ExcludeError, ExcludeRules,
    FormatSelection, Snapshot, IGNORE_FILENAME,
};
use crate::config::{
    ConfigError, ConfigSource, PublicHost, RunMode, Settings, DEFAULT_BACKUP_DIR, DEFAULT_PORT,
};
use crate::lock::{LockError, RunLock};
use crate::logrotate::{LogRotator, DEFAULT_GENERATIONS};
use crate::release::{list_releases, project_name, Release, ReleaseError, ReleaseId, RELEASES_DIRNAME};
use crate::serve::{
    detect_lan_ip, read_pid_file, select_serving_target, BackgroundLauncher, ServeError,
    ServeOptions, ServingTarget, StaticServer, LOG_FILENAME, PID_FILENAME,
};
use crate::signal::TempRegistry;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("exclusion rules: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("archiving error: {0}")]
    Bundle(#[from] BundleError),

    #[error("release slot error: {0}")]
    Release(#[from] ReleaseError),

    #[error("backup root is locked by another run: {0}")]
    Locked(PathBuf),

    #[error("no artifact to serve in {0}")]
    NoArtifact(PathBuf),

    #[error("server failed to start: {0}")]
    ServerStart(ServeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 1,
            PipelineError::Exclude(_) => 1,
            PipelineError::Bundle(e) if e.is_source_error() => 2,
            PipelineError::Bundle(_) => 1,
            PipelineError::Release(_) => 1,
            PipelineError::Locked(_) => 4,
            PipelineError::NoArtifact(_) => 3,
            PipelineError::ServerStart(_) => 5,
            PipelineError::Io(_) => 1,
        }
    }
}

impl From<LockError> for PipelineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Held(path) => PipelineError::Locked(path),
            LockError::Io(e) => PipelineError::Io(e),
        }
    }
}

impl From<ServeError> for PipelineError {
    fn from(e: ServeError) -> Self {
        match e {
            ServeError::NoArtifact(root) => PipelineError::NoArtifact(root),
            other => PipelineError::ServerStart(other),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_root: PathBuf,
    pub backup_root: PathBuf,
    pub formats: FormatSelection,
    /// Prior releases kept (0 = unbounded)
    pub keep: usize,
    pub pointer_mode: PointerMode,
    /// Try system tar/zip before the in-process archivers
    pub external_tools: bool,
    /// Extra exclusion patterns
    pub exclude: Vec<String>,
    /// Command run in the source root before packaging
    pub pre_package: Vec<String>,
    pub mode: RunMode,
    pub port: u16,
    pub bind_address: IpAddr,
    pub public_host: PublicHost,
    pub log_generations: u32,
}

impl PipelineConfig {
    /// Defaults for `source_root`
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        Self {
            backup_root: source_root.join(DEFAULT_BACKUP_DIR),
            source_root,
            formats: FormatSelection::Both,
            keep: DEFAULT_KEEP,
            pointer_mode: PointerMode::Auto,
            external_tools: true,
            exclude: Vec::new(),
            pre_package: Vec::new(),
            mode: RunMode::Foreground,
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_host: PublicHost::Auto,
            log_generations: DEFAULT_GENERATIONS,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            source_root: settings.source_root.clone(),
            backup_root: settings.backup_root.clone(),
            formats: settings.formats,
            keep: settings.keep,
            pointer_mode: settings.pointer_mode,
            external_tools: settings.external_tools,
            exclude: settings.exclude.clone(),
            pre_package: settings.pre_package.clone(),
            mode: settings.mode,
            port: settings.port,
            bind_address: settings.bind_address,
            public_host: settings.public_host.clone(),
            log_generations: settings.log_generations,
        }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.backup_root.join(RELEASES_DIRNAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.backup_root.join(LOG_FILENAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.backup_root.join(PID_FILENAME)
    }
}

/// Outcome of one format in one run
#[derive(Debug, Clone)]
pub struct FormatReport {
    pub format: ArchiveFormat,
    /// Where the artifact was written, if it was
    pub artifact: Option<ArchiveOutcome>,
    pub archive_error: Option<String>,
    pub pointer: Option<PointerKind>,
    pub pointer_error: Option<String>,
}

/// What a packaging run did
#[derive(Debug)]
pub struct RunReport {
    pub release: Release,
    pub project: String,
    pub formats: Vec<FormatReport>,
    /// None when the manifest could not be written
    pub manifest: Option<ReleaseManifest>,
    pub pruned: PruneResult,
    /// Non-fatal problems, in the order they happened
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Formats whose `latest` pointer this run updated
    pub fn fresh_pointers(&self) -> Vec<ArchiveFormat> {
        self.formats
            .iter()
            .filter(|f| f.pointer.is_some())
            .map(|f| f.format)
            .collect()
    }

    /// Artifacts that exist on disk
    pub fn artifacts(&self) -> impl Iterator<Item = &ArchiveOutcome> {
        self.formats.iter().filter_map(|f| f.artifact.as_ref())
    }
}

/// A started server
pub enum ServerHandle {
    /// Bound in this process; the caller drives it
    Foreground(StaticServer),
    /// Detached child process
    Background { pid: u32 },
}

/// Release orchestrator
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<TempRegistry>,
    archiver: Archiver,
    pointers: LatestPointers,
    launcher: Option<BackgroundLauncher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_registry(config, Arc::new(TempRegistry::new()))
    }

    /// Share a temporary-path registry with the signal handler
    pub fn with_registry(config: PipelineConfig, registry: Arc<TempRegistry>) -> Self {
        let archiver = if config.external_tools {
            Archiver::new().with_system_tools()
        } else {
            Archiver::new()
        };
        let pointers = LatestPointers::new(&config.backup_root, config.pointer_mode);

        Self {
            config,
            registry,
            archiver,
            pointers,
            launcher: None,
        }
    }

    /// Replace the archiver
    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = archiver;
        self
    }

    /// Replace how background servers are started
    pub fn with_launcher(mut self, launcher: BackgroundLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pointers(&self) -> &LatestPointers {
        &self.pointers
    }

    pub fn registry(&self) -> &Arc<TempRegistry> {
        &self.registry
    }

    fn exclude_rules(&self) -> PipelineResult<ExcludeRules> {
        let extra: Vec<&str> = self.config.exclude.iter().map(String::as_str).collect();
        let mut rules = ExcludeRules::new()?
            .with_backup_dir(&self.config.backup_root)?
            .with_patterns(&extra)?;

        let ignore_file = self.config.source_root.join(IGNORE_FILENAME);
        if ignore_file.is_file() {
            rules = rules.with_ignore_file(&ignore_file)?;
        }
        Ok(rules)
    }

    /// Package the source tree into a new release
    ///
    /// Holds the backup-root lock for the duration. The release slot is
    /// removed again if the run fails before its manifest step.
    pub fn package(&self) -> PipelineResult<RunReport> {
        fs::create_dir_all(&self.config.backup_root)?;
        let _lock = RunLock::try_acquire(&self.config.backup_root)?;
        let mut warnings = Vec::new();

        if let Err(e) = self.run_pre_package_hook() {
            warn!(error = %e, "pre-package hook failed");
            warnings.push(format!("pre-package hook: {}", e));
        }

        let rules = self.exclude_rules()?;
        let snapshot = Snapshot::capture(&self.config.source_root, &rules)?;
        let source_root = snapshot.root().to_path_buf();
        let project = project_name(&source_root);
        info!(
            source = %source_root.display(),
            files = snapshot.file_count(),
            bytes = snapshot.content_size(),
            "source snapshot taken"
        );

        let release = Release::allocate(&self.config.releases_dir(), Local::now())?;
        let slot = self.registry.track(release.path.clone());
        info!(release = %release.id, "release slot created");

        let mut formats = Vec::new();
        for format in self.config.formats.formats() {
            let output = release.artifact_path(&project, format);
            let (artifact, archive_error) =
                match self.archiver.write_archive(&snapshot, format, &output, &self.registry) {
                    Ok(outcome) => {
                        info!(format = %format, backend = outcome.backend, path = %outcome.path.display(), "artifact written");
                        (Some(outcome), None)
                    }
                    Err(e) if e.is_source_error() => return Err(e.into()),
                    Err(e) => {
                        warn!(format = %format, error = %e, "archiving failed for this format");
                        warnings.push(format!("{} archive: {}", format, e));
                        (None, Some(e.to_string()))
                    }
                };
            formats.push(FormatReport {
                format,
                artifact,
                archive_error,
                pointer: None,
                pointer_error: None,
            });
        }

        let manifest = match self.write_manifest(&release, &project, &source_root, &rules, &formats) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(release = %release.id, error = %e, "manifest not written");
                warnings.push(format!("manifest: {}", e));
                None
            }
        };
        slot.keep();

        for report in formats.iter_mut() {
            let Some(artifact) = &report.artifact else {
                continue;
            };
            match self.pointers.update(report.format, &artifact.path) {
                Ok(kind) => {
                    debug!(format = %report.format, kind = %kind, "latest pointer updated");
                    report.pointer = Some(kind);
                }
                Err(e) => {
                    warn!(format = %report.format, error = %e, "latest pointer not updated");
                    warnings.push(format!("{} pointer: {}", report.format, e));
                    report.pointer_error = Some(e.to_string());
                }
            }
        }

        let pruner = ReleasePruner::new(
            self.config.releases_dir(),
            RetentionPolicy::keep_last_n(self.config.keep),
        );
        let pruned = match pruner.run(Some(&release.id)) {
            Ok(result) => {
                warnings.extend(result.errors.iter().cloned());
                result
            }
            Err(e) => {
                warn!(error = %e, "pruning skipped");
                warnings.push(format!("pruning: {}", e));
                PruneResult::default()
            }
        };

        Ok(RunReport {
            release,
            project,
            formats,
            manifest,
            pruned,
            warnings,
        })
    }

    fn write_manifest(
        &self,
        release: &Release,
        project: &str,
        source_root: &Path,
        rules: &ExcludeRules,
        formats: &[FormatReport],
    ) -> Result<ReleaseManifest, ManifestError> {
        let summaries = formats
            .iter()
            .map(|report| match (&report.artifact, &report.archive_error) {
                (Some(outcome), _) => ArtifactSummary::from_file(&outcome.path, report.format),
                (None, error) => ArtifactSummary::failed(
                    release.artifact_name(project, report.format),
                    report.format,
                    error.clone().unwrap_or_else(|| "not produced".to_string()),
                ),
            })
            .collect();

        let file_count = count_source_files(source_root, rules);
        let manifest = ReleaseManifest::build(release, source_root, summaries, file_count);
        let path = manifest.write_atomic(&release.path)?;
        debug!(path = %path.display(), total_size = manifest.total_size, file_count, "manifest written");
        Ok(manifest)
    }

    fn run_pre_package_hook(&self) -> io::Result<()> {
        let Some((program, args)) = self.config.pre_package.split_first() else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.config.source_root)
            .stdin(Stdio::null())
            .output()?;

        if output.status.success() {
            debug!(hook = %program, "pre-package hook finished");
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }

    /// Choose the artifact to serve from the pointers `report` updated
    pub fn select_target(&self, report: &RunReport) -> PipelineResult<ServingTarget> {
        Ok(select_serving_target(&self.pointers, &report.fresh_pointers())?)
    }

    /// Host used in the serving URL
    pub fn public_host(&self) -> String {
        match &self.config.public_host {
            PublicHost::Fixed(host) => host.clone(),
            PublicHost::Auto if !self.config.bind_address.is_unspecified() => {
                self.config.bind_address.to_string()
            }
            PublicHost::Auto => detect_lan_ip()
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .to_string(),
        }
    }

    /// Rotate the server log, then start the server in the configured mode
    pub fn start_server(&self, target: &ServingTarget) -> PipelineResult<ServerHandle> {
        let rotator = LogRotator::new(self.config.log_path(), self.config.log_generations);
        match rotator.rotate() {
            Ok(true) => debug!(log = %rotator.path().display(), "server log rotated"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "server log rotation failed"),
        }

        let options = ServeOptions {
            root: target.root.clone(),
            bind: self.config.bind_address,
            port: self.config.port,
            log_path: Some(self.config.log_path()),
        };

        match self.config.mode {
            RunMode::Foreground => {
                let server = StaticServer::bind(options.socket_addr(), &options.root, options.log_path.as_deref())
                    .map_err(PipelineError::ServerStart)?;
                Ok(ServerHandle::Foreground(server))
            }
            RunMode::Background => {
                let launcher = match &self.launcher {
                    Some(launcher) => launcher.clone(),
                    None => BackgroundLauncher::current_exe()?,
                };
                let pid = launcher
                    .launch(&options, &self.config.pid_path())
                    .map_err(PipelineError::ServerStart)?;
                Ok(ServerHandle::Background { pid })
            }
        }
    }

    /// Read-only view of the backup root
    pub fn status(&self) -> PipelineResult<StatusReport> {
        let releases = list_releases(&self.config.releases_dir())?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let stats = ReleasePruner::new(self.config.releases_dir(), RetentionPolicy::unlimited()).stats()?;
        let pointers = [ArchiveFormat::Tar, ArchiveFormat::Zip]
            .into_iter()
            .map(|format| {
                let target = self.pointers.resolve(format).and_then(|_| self.pointers.target(format));
                (format, target)
            })
            .collect();

        Ok(StatusReport {
            backup_root: self.config.backup_root.clone(),
            releases,
            stats,
            pointers,
            server_pid: read_pid_file(&self.config.pid_path()),
            config_sources: Vec::new(),
        })
    }
}

/// Snapshot of a backup root for `relpack status`
#[derive(Debug)]
pub struct StatusReport {
    pub backup_root: PathBuf,
    /// Oldest first
    pub releases: Vec<ReleaseId>,
    pub stats: ReleaseStats,
    /// Resolvable pointer targets per format
    pub pointers: Vec<(ArchiveFormat, Option<PathBuf>)>,
    pub server_pid: Option<u32>,
    /// Configuration layers, when the caller knows them
    pub config_sources: Vec<ConfigSource>,
}

impl StatusReport {
    pub fn with_config_sources(mut self, sources: Vec<ConfigSource>) -> Self {
        self.config_sources = sources;
        self
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "backup root: {}", self.backup_root.display())?;
        writeln!(
            f,
            "releases:    {} ({} bytes)",
            self.stats.total_releases, self.stats.total_size_bytes
        )?;
        for id in &self.releases {
            writeln!(f, "  {}", id)?;
        }
        for (format, target) in &self.pointers {
            match target {
                Some(path) => writeln!(f, "{:<12} {}", format!("latest {}:", format), path.display())?,
                None => writeln!(f, "{:<12} -", format!("latest {}:", format))?,
            }
        }
        match self.server_pid {
            Some(pid) => writeln!(f, "server pid:  {}", pid)?,
            None => writeln!(f, "server pid:  -")?,
        }
        for source in &self.config_sources {
            writeln!(f, "config:      {}", source)?;
        }
        Ok(())
    }
}
