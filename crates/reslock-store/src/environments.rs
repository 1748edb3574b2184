use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use reslock_schema::types::{Fingerprint, ResolveName};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

/// Metadata file written at the root of every published environment.
pub const ENV_METADATA_FILE: &str = ".reslock-env.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// The minimal package subset for one closure.
    Subset,
    /// Every package of a lockfile, used as an extraction source.
    Repository,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::Subset => write!(f, "subset"),
            EnvironmentKind::Repository => write!(f, "repository"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledEnvironment {
    pub fingerprint: Fingerprint,
    pub kind: EnvironmentKind,
    pub resolve: ResolveName,
    pub lockfile_fingerprint: Fingerprint,
    /// Installed pins as `name==version`, in lockfile order.
    pub packages: Vec<String>,
    pub created_at: String,
    #[serde(skip)]
    pub path: PathBuf,
    /// blake3 checksum over the metadata content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl InstalledEnvironment {
    pub fn new(
        fingerprint: Fingerprint,
        kind: EnvironmentKind,
        resolve: ResolveName,
        lockfile_fingerprint: Fingerprint,
        packages: Vec<String>,
    ) -> Self {
        Self {
            fingerprint,
            kind,
            resolve,
            lockfile_fingerprint,
            packages,
            created_at: chrono::Utc::now().to_rfc3339(),
            path: PathBuf::new(),
            checksum: None,
        }
    }

    /// Key under which the environment is cached.
    pub fn cache_key(&self) -> &str {
        self.fingerprint.as_str()
    }

    /// Compute the checksum over the metadata content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// An installation in progress. Dropping it discards the partial output.
#[derive(Debug)]
pub struct StagedEnvironment {
    dir: TempDir,
    fingerprint: Fingerprint,
}

impl StagedEnvironment {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Fingerprint-keyed cache of installed environments.
///
/// Environments are published with a single directory rename and never
/// modified afterwards; callers serialize publication per fingerprint.
pub struct EnvironmentStore {
    layout: StoreLayout,
}

impl EnvironmentStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Presence check: the directory exists and its metadata verifies.
    pub fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<InstalledEnvironment>, StoreError> {
        let path = self.layout.env_path(fingerprint);
        let meta_path = path.join(ENV_METADATA_FILE);
        if !meta_path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&meta_path)?;
        let mut env: InstalledEnvironment = serde_json::from_str(&content)?;

        if let Some(ref expected) = env.checksum {
            let actual = env.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    fingerprint: fingerprint.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if env.fingerprint != *fingerprint {
            return Err(StoreError::IntegrityFailure {
                fingerprint: fingerprint.to_string(),
                expected: fingerprint.to_string(),
                actual: env.fingerprint.to_string(),
            });
        }

        env.path = path;
        Ok(Some(env))
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<InstalledEnvironment, StoreError> {
        self.lookup(fingerprint)?
            .ok_or_else(|| StoreError::EnvNotFound(fingerprint.to_string()))
    }

    /// Create an empty staging directory for `fingerprint`.
    pub fn stage(&self, fingerprint: &Fingerprint) -> Result<StagedEnvironment, StoreError> {
        fs::create_dir_all(self.layout.staging_dir())?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", fingerprint.short()))
            .tempdir_in(self.layout.staging_dir())?;
        Ok(StagedEnvironment {
            dir,
            fingerprint: fingerprint.clone(),
        })
    }

    /// Write metadata into the staged directory and rename it into place.
    pub fn publish(
        &self,
        staged: StagedEnvironment,
        mut env: InstalledEnvironment,
    ) -> Result<InstalledEnvironment, StoreError> {
        if env.fingerprint != staged.fingerprint {
            return Err(StoreError::IntegrityFailure {
                fingerprint: staged.fingerprint.to_string(),
                expected: staged.fingerprint.to_string(),
                actual: env.fingerprint.to_string(),
            });
        }
        env.checksum = None;
        env.checksum = Some(env.compute_checksum()?);
        let content = serde_json::to_string_pretty(&env)?;

        let mut tmp = NamedTempFile::new_in(staged.path())?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(staged.path().join(ENV_METADATA_FILE))
            .map_err(|e| StoreError::Io(e.error))?;

        let envs_dir = self.layout.envs_dir();
        fs::create_dir_all(&envs_dir)?;
        let dest = self.layout.env_path(&env.fingerprint);
        fs::rename(staged.path(), &dest)?;
        fsync_dir(&envs_dir)?;
        // `staged` is dropped here; its directory no longer exists.

        tracing::debug!(
            "published {} environment {} at {}",
            env.kind,
            env.fingerprint.short(),
            dest.display()
        );
        env.path = dest;
        Ok(env)
    }

    pub fn list(&self) -> Result<Vec<InstalledEnvironment>, StoreError> {
        let dir = self.layout.envs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else {
                continue;
            };
            match self.lookup(&Fingerprint::new(name_str)) {
                Ok(Some(env)) => results.push(env),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("skipping corrupted environment '{name_str}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(results)
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let path = self.layout.env_path(fingerprint);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}
