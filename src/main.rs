//! relpack CLI
//!
//! Entry point for the `relpack` command-line tool.

use clap::{Parser, Subcommand};
use relpack::config::{ConfigFile, EffectiveConfig, Settings, CONFIG_FILENAME};
use relpack::logging::{self, LogFormat};
use relpack::notify;
use relpack::pipeline::{Pipeline, PipelineConfig, PipelineError, ServerHandle};
use relpack::serve::StaticServer;
use relpack::signal::{CleanupGuard, SignalHandler, TempRegistry};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "relpack")]
#[command(about = "Package a directory into versioned releases and serve the latest", version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory to package (default: current directory)
    source: Option<PathBuf>,

    /// Port for the file server (invalid values fall back to 8000)
    port: Option<String>,

    /// Server mode: foreground or background
    mode: Option<String>,

    /// Artifact formats: tar, zip or both
    format: Option<String>,

    /// Prior releases to keep (0 keeps all)
    keep: Option<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Path to config file (default: <source>/relpack.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Backup directory (relative paths are under the source directory)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Only use the built-in archivers
    #[arg(long)]
    no_external_tools: bool,

    /// Do not print a QR code for the URL
    #[arg(long)]
    no_qr: bool,

    /// Do not copy the URL to the clipboard
    #[arg(long)]
    no_clipboard: bool,

    /// Debug-level logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Log output format: human or json
    #[arg(long, default_value = "human", global = true)]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory's `latest.*` files (used by background mode)
    Serve {
        /// Directory holding the pointers
        #[arg(long)]
        root: PathBuf,

        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        #[arg(long, default_value_t = relpack::config::DEFAULT_PORT)]
        port: u16,

        /// Access log file
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Show releases, pointers and the background server PID
    Status {
        /// Directory that was packaged (default: current directory)
        source: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_format = match cli.common.log_format.parse::<LogFormat>() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    logging::init(log_format, cli.common.verbose);

    let code = match cli.command {
        Some(Commands::Serve {
            root,
            bind,
            port,
            log,
        }) => run_serve(root, SocketAddr::new(bind, port), log),
        Some(Commands::Status { source }) => run_status(source, &cli.common),
        None => {
            let positionals = Positionals {
                port: cli.port,
                mode: cli.mode,
                format: cli.format,
                keep: cli.keep,
            };
            run_release(cli.source, positionals, &cli.common)
        }
    };

    process::exit(code);
}

struct Positionals {
    port: Option<String>,
    mode: Option<String>,
    format: Option<String>,
    keep: Option<String>,
}

/// Command-line layer of the configuration: only keys that were given
fn cli_overrides(positionals: &Positionals, common: &CommonArgs) -> Value {
    let mut map = Map::new();
    if let Some(port) = &positionals.port {
        map.insert("port".into(), Value::String(port.clone()));
    }
    if let Some(mode) = &positionals.mode {
        map.insert("mode".into(), Value::String(mode.clone()));
    }
    if let Some(format) = &positionals.format {
        map.insert("format".into(), Value::String(format.clone()));
    }
    if let Some(keep) = &positionals.keep {
        map.insert("keep".into(), Value::String(keep.clone()));
    }
    if let Some(dir) = &common.backup_dir {
        map.insert(
            "backup_dir".into(),
            Value::String(dir.to_string_lossy().into_owned()),
        );
    }
    if common.no_external_tools {
        map.insert("external_tools".into(), Value::Bool(false));
    }

    let mut notify = Map::new();
    if common.no_qr {
        notify.insert("qr".into(), Value::Bool(false));
    }
    if common.no_clipboard {
        notify.insert("clipboard".into(), Value::Bool(false));
    }
    if !notify.is_empty() {
        map.insert("notify".into(), Value::Object(notify));
    }

    Value::Object(map)
}

fn load_settings(source: Option<PathBuf>, overrides: Value, common: &CommonArgs) -> Result<Settings, PipelineError> {
    let source_root = source.unwrap_or_else(|| PathBuf::from("."));
    let default_file = source_root.join(CONFIG_FILENAME);
    let file = match &common.config {
        Some(path) => ConfigFile::Explicit(path),
        None => ConfigFile::Optional(&default_file),
    };

    let effective = EffectiveConfig::build(file, Some(overrides))?;
    let settings = Settings::resolve(&source_root, &effective)?;
    for warning in &settings.warnings {
        warn!("{}", warning);
    }
    Ok(settings)
}

fn run_release(source: Option<PathBuf>, positionals: Positionals, common: &CommonArgs) -> i32 {
    let registry = Arc::new(TempRegistry::new());
    let guard = CleanupGuard::new(Arc::clone(&registry));
    let signals = SignalHandler::new(Arc::clone(&registry));
    if let Err(e) = signals.install() {
        warn!(error = %e, "signal handler not installed");
    }

    let result = release(source, positionals, common, registry, &signals);
    drop(guard);

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn release(
    source: Option<PathBuf>,
    positionals: Positionals,
    common: &CommonArgs,
    registry: Arc<TempRegistry>,
    signals: &SignalHandler,
) -> Result<(), PipelineError> {
    let overrides = cli_overrides(&positionals, common);
    let settings = load_settings(source, overrides, common)?;
    let pipeline = Pipeline::with_registry(PipelineConfig::from_settings(&settings), registry);

    let report = pipeline.package()?;
    info!(
        release = %report.release.id,
        artifacts = report.artifacts().count(),
        pruned = report.pruned.deleted.len(),
        warnings = report.warnings.len(),
        "release packaged"
    );

    let target = pipeline.select_target(&report)?;
    let host = pipeline.public_host();
    let handle = pipeline.start_server(&target)?;

    match handle {
        ServerHandle::Background { pid } => {
            let url = target.url(&host, settings.port);
            info!(pid, "background server started");
            println!("{}", url);
            notify::notify_all(&notify::detect(settings.qr, settings.clipboard), &url);
            Ok(())
        }
        ServerHandle::Foreground(mut server) => {
            let url = target.url(&host, server.local_port());
            println!("{}", url);
            notify::notify_all(&notify::detect(settings.qr, settings.clipboard), &url);

            let state = signals.state();
            state.set_serving(true);
            let served = server.serve_until(state.stop_flag());
            state.set_serving(false);
            served.map_err(PipelineError::ServerStart)
        }
    }
}

fn run_serve(root: PathBuf, addr: SocketAddr, log: Option<PathBuf>) -> i32 {
    let signals = SignalHandler::new(Arc::new(TempRegistry::new()));
    if let Err(e) = signals.install() {
        warn!(error = %e, "signal handler not installed");
    }

    let mut server = match StaticServer::bind(addr, &root, log.as_deref()) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return PipelineError::ServerStart(e).exit_code();
        }
    };

    let state = signals.state();
    state.set_serving(true);
    match server.serve_until(state.stop_flag()) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn run_status(source: Option<PathBuf>, common: &CommonArgs) -> i32 {
    let overrides = cli_overrides(
        &Positionals {
            port: None,
            mode: None,
            format: None,
            keep: None,
        },
        common,
    );

    let status = load_settings(source, overrides, common).and_then(|settings| {
        let report = Pipeline::new(PipelineConfig::from_settings(&settings)).status()?;
        Ok(report.with_config_sources(settings.sources))
    });

    match status {
        Ok(status) => {
            print!("{}", status);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}
