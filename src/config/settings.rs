//! Typed settings resolved from the effective configuration
//!
//! Port and retention bound are lenient: a bad value is replaced by the
//! default and a warning is recorded. Everything else that cannot be
//! understood is a [`ConfigError`].

use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::defaults::{DEFAULT_BACKUP_DIR, DEFAULT_PORT};
use super::effective::{ConfigError, ConfigSource, EffectiveConfig};
use crate::artifact::{PointerMode, DEFAULT_KEEP};
use crate::bundle::FormatSelection;
use crate::logrotate::DEFAULT_GENERATIONS;

/// What happens once the artifact is ready to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Serve in this process until interrupted
    #[default]
    Foreground,
    /// Start a detached server and return
    Background,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "foreground" | "fg" => Ok(RunMode::Foreground),
            "background" | "bg" => Ok(RunMode::Background),
            other => Err(format!(
                "invalid mode '{}' (expected foreground or background)",
                other
            )),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Foreground => f.write_str("foreground"),
            RunMode::Background => f.write_str("background"),
        }
    }
}

/// Host part of the serving URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicHost {
    /// Primary LAN address, else loopback
    Auto,
    Fixed(String),
}

/// Fully resolved settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_root: PathBuf,
    pub backup_root: PathBuf,
    pub port: u16,
    pub mode: RunMode,
    pub formats: FormatSelection,
    pub keep: usize,
    pub bind_address: IpAddr,
    pub public_host: PublicHost,
    pub log_generations: u32,
    pub pointer_mode: PointerMode,
    pub external_tools: bool,
    pub exclude: Vec<String>,
    pub pre_package: Vec<String>,
    pub qr: bool,
    pub clipboard: bool,
    /// Configuration layers these settings were merged from
    pub sources: Vec<ConfigSource>,
    /// Values that were replaced by defaults
    pub warnings: Vec<String>,
}

impl Settings {
    /// Resolve settings for `source_root`
    ///
    /// Both roots come out absolute. A relative `backup_dir` is taken
    /// relative to the source root.
    pub fn resolve(source_root: &Path, effective: &EffectiveConfig) -> Result<Self, ConfigError> {
        let mut warnings = Vec::new();
        let source_root = absolute(source_root)?;

        let (port, warning) = parse_port(effective.get("port"));
        warnings.extend(warning);
        let (keep, warning) = parse_keep(effective.get("keep"));
        warnings.extend(warning);

        let mode = parse_with(effective, "mode", RunMode::from_str)?.unwrap_or_default();
        let formats = parse_with(effective, "format", FormatSelection::from_str)?.unwrap_or_default();
        let pointer_mode =
            parse_with(effective, "pointer_mode", PointerMode::from_str)?.unwrap_or_default();
        let bind_address = parse_with(effective, "server.bind_address", |s| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|e| format!("invalid bind address '{}': {}", s, e))
        })?
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let public_host = match effective.get_str("server.public_host").map(str::trim) {
            None | Some("") | Some("auto") => PublicHost::Auto,
            Some(host) => PublicHost::Fixed(host.to_string()),
        };

        let log_generations = match effective.get("server.log_generations") {
            None | Some(Value::Null) => DEFAULT_GENERATIONS,
            Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(n) if n > 0 => n,
                _ => {
                    warnings.push(format!(
                        "invalid server.log_generations {}, using {}",
                        v, DEFAULT_GENERATIONS
                    ));
                    DEFAULT_GENERATIONS
                }
            },
        };

        let backup_dir = effective.get_str("backup_dir").unwrap_or(DEFAULT_BACKUP_DIR);
        if backup_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backup_dir must not be empty".to_string(),
            ));
        }
        let backup_root: PathBuf = source_root.join(backup_dir).components().collect();

        Ok(Self {
            source_root,
            backup_root,
            port,
            mode,
            formats,
            keep,
            bind_address,
            public_host,
            log_generations,
            pointer_mode,
            external_tools: effective.get_bool("external_tools").unwrap_or(true),
            exclude: string_list(effective, "exclude")?,
            pre_package: string_list(effective, "pre_package")?,
            qr: effective.get_bool("notify.qr").unwrap_or(true),
            clipboard: effective.get_bool("notify.clipboard").unwrap_or(true),
            sources: effective.sources.clone(),
            warnings,
        })
    }
}

/// Parse a port from a number or a string
///
/// Anything outside 1..=65535 falls back to [`DEFAULT_PORT`] with a warning.
pub fn parse_port(value: Option<&Value>) -> (u16, Option<String>) {
    let parsed = match value {
        None | Some(Value::Null) => return (DEFAULT_PORT, None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };

    match parsed.and_then(|n| u16::try_from(n).ok()) {
        Some(port) if port > 0 => (port, None),
        _ => (
            DEFAULT_PORT,
            Some(format!(
                "invalid port {}, falling back to {}",
                display_value(value),
                DEFAULT_PORT
            )),
        ),
    }
}

/// Parse the retention bound from a number or a string
pub fn parse_keep(value: Option<&Value>) -> (usize, Option<String>) {
    let parsed = match value {
        None | Some(Value::Null) => return (DEFAULT_KEEP, None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };

    match parsed.and_then(|n| usize::try_from(n).ok()) {
        Some(keep) => (keep, None),
        None => (
            DEFAULT_KEEP,
            Some(format!(
                "invalid retention bound {}, falling back to {}",
                display_value(value),
                DEFAULT_KEEP
            )),
        ),
    }
}

/// `path` joined onto the working directory when relative, without `.` parts
fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ConfigError::IoError(format!("current directory: {}", e)))?
            .join(path)
    };
    Ok(joined.components().collect())
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => format!("'{}'", s),
        Some(v) => v.to_string(),
        None => "<none>".to_string(),
    }
}

fn parse_with<T, F>(effective: &EffectiveConfig, key: &str, parse: F) -> Result<Option<T>, ConfigError>
where
    F: FnOnce(&str) -> Result<T, String>,
{
    match effective.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse(s).map(Some).map_err(ConfigError::ValidationError),
        Some(other) => Err(ConfigError::ValidationError(format!(
            "{} must be a string, got {}",
            key, other
        ))),
    }
}

fn string_list(effective: &EffectiveConfig, key: &str) -> Result<Vec<String>, ConfigError> {
    match effective.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ConfigError::ValidationError(format!("{} entries must be strings", key))
                })
            })
            .collect(),
        Some(_) => Err(ConfigError::ValidationError(format!(
            "{} must be a list of strings",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use serde_json::json;

    fn resolve(cli: Value) -> Result<Settings, ConfigError> {
        let effective = EffectiveConfig::build(ConfigFile::None, Some(cli))?;
        Settings::resolve(Path::new("/src/site"), &effective)
    }

    #[test]
    fn test_defaults() {
        let settings = resolve(json!({})).unwrap();

        assert_eq!(settings.port, 8000);
        assert_eq!(settings.mode, RunMode::Foreground);
        assert_eq!(settings.formats, FormatSelection::Both);
        assert_eq!(settings.keep, 5);
        assert_eq!(settings.backup_root, PathBuf::from("/src/site/.release_backups"));
        assert_eq!(settings.public_host, PublicHost::Auto);
        assert_eq!(settings.pointer_mode, PointerMode::Auto);
        assert!(settings.warnings.is_empty());
    }

    #[test]
    fn test_port_fallbacks() {
        for bad in [json!("abc"), json!("70000"), json!(0), json!(-5), json!("8o80"), json!(true)] {
            let (port, warning) = parse_port(Some(&bad));
            assert_eq!(port, DEFAULT_PORT, "{bad}");
            assert!(warning.unwrap().contains("falling back to 8000"));
        }
        assert_eq!(parse_port(Some(&json!("9090"))), (9090, None));
        assert_eq!(parse_port(Some(&json!(65535))), (65535, None));
    }

    #[test]
    fn test_invalid_port_is_a_warning_not_an_error() {
        let settings = resolve(json!({"port": "not-a-port"})).unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.warnings.len(), 1);
    }

    #[test]
    fn test_keep_parsing() {
        assert_eq!(parse_keep(Some(&json!("0"))), (0, None));
        assert_eq!(parse_keep(Some(&json!(3))), (3, None));
        let (keep, warning) = parse_keep(Some(&json!("-1")));
        assert_eq!(keep, DEFAULT_KEEP);
        assert!(warning.is_some());
    }

    #[test]
    fn test_invalid_mode_and_format_are_errors() {
        assert!(matches!(
            resolve(json!({"mode": "sideways"})),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            resolve(json!({"format": "rar"})),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(resolve(json!({"server": {"bind_address": "nope"}})).is_err());
    }

    #[test]
    fn test_overrides() {
        let settings = resolve(json!({
            "mode": "background",
            "format": "zip",
            "backup_dir": "/var/backups/site",
            "server": {"public_host": "example.test", "log_generations": 2},
            "pointer_mode": "copy",
            "exclude": ["dist"],
            "notify": {"qr": false}
        }))
        .unwrap();

        assert_eq!(settings.mode, RunMode::Background);
        assert_eq!(settings.formats, FormatSelection::ZipOnly);
        assert_eq!(settings.backup_root, PathBuf::from("/var/backups/site"));
        assert_eq!(settings.public_host, PublicHost::Fixed("example.test".to_string()));
        assert_eq!(settings.log_generations, 2);
        assert_eq!(settings.pointer_mode, PointerMode::Copy);
        assert_eq!(settings.exclude, vec!["dist"]);
        assert!(!settings.qr);
        assert!(settings.clipboard);
    }

    #[test]
    fn test_relative_roots_are_made_absolute() {
        let effective = EffectiveConfig::build(ConfigFile::None, None).unwrap();
        let cwd = std::env::current_dir().unwrap();

        let settings = Settings::resolve(Path::new("."), &effective).unwrap();
        assert_eq!(settings.source_root, cwd);
        assert_eq!(settings.backup_root, cwd.join(".release_backups"));

        let settings = Settings::resolve(Path::new("./site"), &effective).unwrap();
        assert!(settings.backup_root.is_absolute());
        assert_eq!(settings.backup_root, cwd.join("site/.release_backups"));
    }

    #[test]
    fn test_list_entries_must_be_strings() {
        assert!(resolve(json!({"exclude": [1, 2]})).is_err());
    }
}
