//! Merged configuration with provenance
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML
//! file, then command-line overrides. Each contributing file is recorded
//! with the SHA-256 of its bytes; `relpack status` prints the layers so
//! the file in effect can be told apart from an edited copy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;

/// Config file looked up in the source root when none is given
pub const CONFIG_FILENAME: &str = "relpack.toml";

/// Which layer a setting came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// One layer that contributed to the merged configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// Set for file layers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Hex SHA-256 of the file as read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            ConfigOrigin::Builtin => f.write_str("builtin defaults"),
            ConfigOrigin::Cli => f.write_str("command line"),
            ConfigOrigin::File => {
                write!(f, "{}", self.path.as_deref().unwrap_or("<file>"))?;
                if let Some(digest) = &self.digest {
                    write!(f, " (sha256 {})", digest)?;
                }
                Ok(())
            }
        }
    }
}

/// Where to look for the config file
#[derive(Debug, Clone, Copy)]
pub enum ConfigFile<'a> {
    /// Given explicitly; must exist
    Explicit(&'a Path),
    /// Conventional location; skipped when absent
    Optional(&'a Path),
    None,
}

/// Merged configuration for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub config: Value,

    /// Layers, lowest precedence first
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Merge defaults, the config file (if any) and command-line overrides
    pub fn build(file: ConfigFile<'_>, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        let path = match file {
            ConfigFile::Explicit(path) => Some(path),
            ConfigFile::Optional(path) if path.exists() => Some(path),
            _ => None,
        };
        if let Some(path) = path {
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let config = merge_layers(layers);
        if !config.is_object() {
            return Err(ConfigError::ValidationError(
                "configuration must be a table".to_string(),
            ));
        }

        Ok(Self { config, sources })
    }

    /// Read a TOML file as a JSON value plus the digest of its bytes
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("{}: not UTF-8: {}", path.display(), e)))?;

        let toml_value: toml::Value = toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("{}: TOML parse error: {}", path.display(), e))
        })?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => Value::Array(arr.into_iter().map(Self::toml_to_json).collect()),
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// Look up a dotted key such as `server.bind_address`
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }
}

/// Failure to read or understand the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    IoError(String),

    #[error("invalid config file: {0}")]
    ParseError(String),

    #[error("invalid setting: {0}")]
    ValidationError(String),
}
