//! Lockfile persistence and the installed-environment cache for reslock.
//!
//! This crate provides the storage layer: `LockfileStore` for reading and
//! atomically publishing per-resolve lockfiles, `EnvironmentStore` for
//! fingerprint-keyed installed environments with checksummed metadata, and
//! `StoreLayout` for directory structure management.

pub mod environments;
pub mod layout;
pub mod lockfiles;

pub use environments::{
    EnvironmentKind, EnvironmentStore, InstalledEnvironment, StagedEnvironment, ENV_METADATA_FILE,
};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lockfiles::{LockfileStatus, LockfileStore};

use reslock_schema::lockfile::LockError;
use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for environment '{fingerprint}': expected {expected}, got {actual}")]
    IntegrityFailure {
        fingerprint: String,
        expected: String,
        actual: String,
    },
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Lockfile(#[from] LockError),
}
