//! Release artifacts after they are written
//!
//! Hashing and the per-release manifest, the stable `latest` pointers,
//! and retention of old release slots.

pub mod gc;
mod manifest;
mod pointer;

pub use gc::{dir_size, PruneResult, ReleasePruner, ReleaseStats, RetentionPolicy, DEFAULT_KEEP};
pub use manifest::{
    count_source_files, hash_file, ArtifactSummary, FileDigest, ManifestError, ReleaseManifest,
    HASH_CHUNK_SIZE, MANIFEST_FILENAME, SCHEMA_VERSION,
};
pub use pointer::{LatestPointers, PointerError, PointerKind, PointerMode, POINTER_PREFIX};
