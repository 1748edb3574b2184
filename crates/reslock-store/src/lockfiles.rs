use crate::StoreError;
use reslock_schema::lockfile::{LockError, LockfileEntry, LockfileFormat};
use reslock_schema::normalize::ResolveConfig;
use reslock_schema::types::Fingerprint;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockfileStatus {
    Missing,
    Fresh,
    Stale { found: Fingerprint },
}

impl std::fmt::Display for LockfileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockfileStatus::Missing => write!(f, "missing"),
            LockfileStatus::Fresh => write!(f, "fresh"),
            LockfileStatus::Stale { .. } => write!(f, "stale"),
        }
    }
}

/// Per-resolve lockfiles at the paths declared in configuration.
///
/// Each resolve owns exactly one path; publishing one resolve's lockfile
/// never reads or writes another's.
#[derive(Debug, Clone)]
pub struct LockfileStore {
    root: PathBuf,
}

impl LockfileStore {
    /// `root` is the directory lockfile paths are relative to.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, resolve: &ResolveConfig) -> PathBuf {
        self.root.join(&resolve.lockfile)
    }

    pub fn load(&self, resolve: &ResolveConfig) -> Result<Option<LockfileEntry>, StoreError> {
        let path = self.path_for(resolve);
        if !path.exists() {
            return Ok(None);
        }
        let entry = LockfileEntry::read_from_file(&path)?;
        if entry.metadata.resolve != resolve.name {
            return Err(LockError::ResolveMismatch {
                header: entry.metadata.resolve.to_string(),
                body: resolve.name.to_string(),
            }
            .into());
        }
        Ok(Some(entry))
    }

    /// Format of the existing lockfile, so regeneration keeps it.
    pub fn existing_format(&self, resolve: &ResolveConfig) -> Option<LockfileFormat> {
        let content = fs::read_to_string(self.path_for(resolve)).ok()?;
        Some(LockfileFormat::detect(&content))
    }

    /// Atomically replace the resolve's lockfile.
    pub fn publish(
        &self,
        resolve: &ResolveConfig,
        entry: &LockfileEntry,
        format: LockfileFormat,
    ) -> Result<PathBuf, StoreError> {
        if entry.metadata.resolve != resolve.name {
            return Err(LockError::ResolveMismatch {
                header: entry.metadata.resolve.to_string(),
                body: resolve.name.to_string(),
            }
            .into());
        }
        let path = self.path_for(resolve);
        entry.write_to_file(&path, format)?;
        tracing::info!(
            "wrote {format} lockfile for resolve '{}' to {}",
            resolve.name,
            path.display()
        );
        Ok(path)
    }

    pub fn status(
        &self,
        resolve: &ResolveConfig,
        expected: &Fingerprint,
    ) -> Result<LockfileStatus, StoreError> {
        Ok(match self.load(resolve)? {
            None => LockfileStatus::Missing,
            Some(entry) if &entry.metadata.requirements_fingerprint == expected => {
                LockfileStatus::Fresh
            }
            Some(entry) => LockfileStatus::Stale {
                found: entry.metadata.requirements_fingerprint,
            },
        })
    }
}
