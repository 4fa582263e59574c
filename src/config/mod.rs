//! Configuration
//!
//! Three layers, merged in order:
//! 1. Built-in defaults
//! 2. Config file (`--config <path>`, else `<source_root>/relpack.toml`)
//! 3. Command-line arguments

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, DEFAULT_BACKUP_DIR, DEFAULT_PORT};
pub use effective::{
    ConfigError, ConfigFile, ConfigOrigin, ConfigSource, EffectiveConfig, CONFIG_FILENAME,
};
pub use merge::{deep_merge, merge_layers};
pub use settings::{parse_keep, parse_port, PublicHost, RunMode, Settings};
