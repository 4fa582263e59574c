//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for all configuration values.

use serde::{Deserialize, Serialize};

use crate::artifact::DEFAULT_KEEP;
use crate::logrotate::DEFAULT_GENERATIONS;

/// Port used when none is given or the given one is invalid
pub const DEFAULT_PORT: u16 = 8000;

/// Backup root name, relative to the source root
pub const DEFAULT_BACKUP_DIR: &str = ".release_backups";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Server port (default: 8000)
    pub port: u16,

    /// Run mode (default: "foreground")
    pub mode: String,

    /// Archive formats (default: "both")
    pub format: String,

    /// Prior releases kept (default: 5, 0 = unbounded)
    pub keep: usize,

    /// Backup root (default: ".release_backups")
    pub backup_dir: String,

    /// Server bind address (default: "0.0.0.0")
    pub bind_address: String,

    /// Host shown in the serving URL (default: "auto")
    pub public_host: String,

    /// Server log generations (default: 5)
    pub log_generations: u32,

    /// Pointer materialization (default: "auto")
    pub pointer_mode: String,

    /// Try system tar/zip first (default: true)
    pub external_tools: bool,

    pub qr: bool,

    pub clipboard: bool,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            mode: "foreground".to_string(),
            format: "both".to_string(),
            keep: DEFAULT_KEEP,
            backup_dir: DEFAULT_BACKUP_DIR.to_string(),
            bind_address: "0.0.0.0".to_string(),
            public_host: "auto".to_string(),
            log_generations: DEFAULT_GENERATIONS,
            pointer_mode: "auto".to_string(),
            external_tools: true,
            qr: true,
            clipboard: true,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "port": self.port,
            "mode": self.mode,
            "format": self.format,
            "keep": self.keep,
            "backup_dir": self.backup_dir,
            "server": {
                "bind_address": self.bind_address,
                "public_host": self.public_host,
                "log_generations": self.log_generations
            },
            "pointer_mode": self.pointer_mode,
            "external_tools": self.external_tools,
            "exclude": [],
            "pre_package": [],
            "notify": {
                "qr": self.qr,
                "clipboard": self.clipboard
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.port, 8000);
        assert_eq!(defaults.mode, "foreground");
        assert_eq!(defaults.format, "both");
        assert_eq!(defaults.keep, 5);
        assert_eq!(defaults.backup_dir, ".release_backups");
        assert!(defaults.external_tools);
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["port"], 8000);
        assert_eq!(value["server"]["bind_address"], "0.0.0.0");
        assert_eq!(value["server"]["log_generations"], 5);
        assert_eq!(value["notify"]["qr"], true);
        assert!(value["exclude"].as_array().unwrap().is_empty());
    }
}
