//! relpack - versioned release packaging for a source tree
//!
//! Each run snapshots a directory into a timestamped release (tarball
//! and/or zip plus a SHA-256 manifest), moves the `latest.*` pointers,
//! prunes old releases and serves the newest artifact over HTTP.

pub mod artifact;
pub mod bundle;
pub mod config;
pub mod lock;
pub mod logging;
pub mod logrotate;
pub mod notify;
pub mod pipeline;
pub mod release;
pub mod serve;
pub mod signal;

pub use artifact::{LatestPointers, PointerKind, PointerMode, ReleaseManifest, ReleasePruner, RetentionPolicy};
pub use bundle::{ArchiveFormat, Archiver, ExcludeRules, FormatSelection, Snapshot};
pub use config::{EffectiveConfig, RunMode, Settings};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineResult, RunReport, ServerHandle};
pub use release::{Release, ReleaseId};
pub use serve::{ServingTarget, StaticServer};
pub use signal::{CleanupGuard, SignalHandler, TempRegistry};
