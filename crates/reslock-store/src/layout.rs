use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the installed-environment cache.
///
/// ```text
/// <root>/
///   envs/<fingerprint>/   published environments, never modified in place
///   staging/              in-progress installs, discarded on failure
///   locks/                advisory lock files, one per resolve or fingerprint
///   version
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    #[inline]
    pub fn env_path(&self, fingerprint: &str) -> PathBuf {
        self.envs_dir().join(fingerprint)
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock file serializing solves of one resolve across processes.
    pub fn resolve_lock_path(&self, resolve: &str) -> PathBuf {
        self.locks_dir().join(format!("resolve-{resolve}.lock"))
    }

    /// Lock file serializing installation of one fingerprint across processes.
    pub fn env_lock_path(&self, fingerprint: &str) -> PathBuf {
        self.locks_dir().join(format!("env-{fingerprint}.lock"))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.envs_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.locks_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
