use crate::marker::{MarkerError, TargetEnvironment};
use crate::requirement::{PipRequirement, RequirementError, RequirementSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported config_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("invalid resolve name '{0}', expected [a-zA-Z0-9_-]+")]
    InvalidResolveName(String),
    #[error("default_resolve '{0}' is not declared in [resolves]")]
    UnknownDefaultResolve(String),
    #[error("{context} refers to unknown resolve '{name}'")]
    UnknownResolve { name: String, context: String },
    #[error("{0}: resolve parametrize list must not be empty")]
    EmptyParametrize(String),
    #[error("resolves '{first}' and '{second}' share the lockfile '{path}'")]
    SharedLockfile {
        path: String,
        first: String,
        second: String,
    },
    #[error("requirement '{0}' sets both `modules` and `type_stub_modules`")]
    ModulesAndStubs(String),
    #[error("{0}")]
    Requirement(#[from] RequirementError),
    #[error("{0}")]
    Marker(#[from] MarkerError),
    #[error("{path}:{line}: {source}")]
    RequirementsFile {
        path: String,
        line: usize,
        source: RequirementError,
    },
    #[error("unit address must not be empty")]
    EmptyAddress,
    #[error("solver.attempts must be at least 1")]
    ZeroAttempts,
}

pub const DEFAULT_RESOLVE_NAME: &str = "python-default";
pub const DEFAULT_LOCKFILE_PATH: &str = "3rdparty/python/default.lock";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigV1 {
    pub config_version: u32,
    #[serde(default = "default_resolve_name")]
    pub default_resolve: String,
    #[serde(default)]
    pub interpreter_constraints: Vec<String>,
    #[serde(default)]
    pub invalid_lockfile_behavior: InvalidLockfileBehavior,
    #[serde(default)]
    pub resolves: BTreeMap<String, ResolveSection>,
    #[serde(default)]
    pub target_environments: Vec<TargetEnvironment>,
    #[serde(default)]
    pub solver: SolverSection,
    #[serde(default)]
    pub installer: InstallerSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub module_mapping: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub type_stubs_module_mapping: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "requirement")]
    pub requirements: Vec<RequirementDecl>,
    #[serde(default, rename = "requirements_file")]
    pub requirements_files: Vec<RequirementsFileDecl>,
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitDecl>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolveSection {
    pub lockfile: String,
    #[serde(default)]
    pub interpreter_constraints: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvalidLockfileBehavior {
    #[default]
    Error,
    Warn,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SolverBackendKind {
    #[default]
    EagerSubset,
    FullMaterialize,
    Mock,
}

impl SolverBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SolverBackendKind::EagerSubset => "eager-subset",
            SolverBackendKind::FullMaterialize => "full-materialize",
            SolverBackendKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for SolverBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SolverSection {
    #[serde(default)]
    pub backend: SolverBackendKind,
    /// Solver executable; each backend has its own default.
    #[serde(default)]
    pub program: Option<String>,
    /// Argument template with `{output}`, `{requirements}` and `{resolve}` placeholders.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
}

impl Default for SolverSection {
    fn default() -> Self {
        Self {
            backend: SolverBackendKind::default(),
            program: None,
            args: None,
            attempts: default_attempts(),
            platforms: default_platforms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    #[default]
    Pip,
    Mock,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstallerSection {
    #[serde(default)]
    pub backend: InstallerKind,
    #[serde(default = "default_python")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for InstallerSection {
    fn default() -> Self {
        Self {
            backend: InstallerKind::default(),
            program: default_python(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnownedDependencyBehavior {
    Error,
    #[default]
    Warning,
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityBehavior {
    #[default]
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InferenceSection {
    #[serde(default)]
    pub unowned_dependency_behavior: UnownedDependencyBehavior,
    #[serde(default)]
    pub ambiguity_behavior: AmbiguityBehavior,
    #[serde(default)]
    pub ignored_modules: Vec<String>,
}

/// The `resolve` field of a declaration: one resolve, or one copy per listed resolve.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResolveField {
    Single(String),
    Parametrize { parametrize: Vec<String> },
}

impl ResolveField {
    pub fn names(&self) -> Vec<&str> {
        match self {
            ResolveField::Single(name) => vec![name.as_str()],
            ResolveField::Parametrize { parametrize } => {
                parametrize.iter().map(String::as_str).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RequirementDecl {
    pub name: String,
    /// Address suffix; defaults to the distribution name.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub specifiers: Vec<String>,
    #[serde(default)]
    pub extras: Vec<String>,
    #[serde(default)]
    pub markers: Option<String>,
    #[serde(default)]
    pub modules: Option<Vec<String>>,
    #[serde(default)]
    pub type_stub_modules: Option<Vec<String>>,
    #[serde(default)]
    pub resolve: Option<ResolveField>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub source: Option<RequirementSource>,
}

impl RequirementDecl {
    pub fn from_pip(req: PipRequirement) -> Self {
        Self {
            name: req.name,
            target: None,
            specifiers: req.specifiers,
            extras: req.extras,
            markers: req.markers,
            modules: None,
            type_stub_modules: None,
            resolve: None,
            dependencies: Vec::new(),
            source: req.source,
        }
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }

    pub fn to_pip(&self) -> PipRequirement {
        PipRequirement {
            name: self.name.trim().to_owned(),
            extras: self.extras.clone(),
            specifiers: self.specifiers.clone(),
            markers: self.markers.clone(),
            source: self.source.clone(),
        }
    }
}

/// Bulk declaration: one requirement per line of a requirements-style manifest.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RequirementsFileDecl {
    pub path: String,
    #[serde(default)]
    pub resolve: Option<ResolveField>,
    #[serde(default)]
    pub module_mapping: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub type_stubs_module_mapping: BTreeMap<String, Vec<String>>,
}

impl RequirementsFileDecl {
    /// Generate one declaration per requirement line.
    ///
    /// Blank lines and comments are skipped; pip options (`-r`, `--index-url`, ...)
    /// are skipped with a warning since they cannot be expressed per requirement.
    pub fn generate(&self, content: &str) -> Result<Vec<RequirementDecl>, ConfigError> {
        let mut out = Vec::new();
        let mut pending = String::new();
        let mut start_line = 0;
        for (idx, raw) in content.lines().enumerate() {
            let line = strip_comment(raw);
            if pending.is_empty() {
                start_line = idx + 1;
            }
            if let Some(cont) = line.strip_suffix('\\') {
                pending.push_str(cont);
                pending.push(' ');
                continue;
            }
            pending.push_str(line);
            let full = std::mem::take(&mut pending);
            let full = full.trim();
            if full.is_empty() {
                continue;
            }
            if full.starts_with('-') {
                tracing::warn!(
                    "{}:{start_line}: ignoring pip option '{full}' in requirements file",
                    self.path
                );
                continue;
            }
            let req = PipRequirement::parse(full).map_err(|source| ConfigError::RequirementsFile {
                path: self.path.clone(),
                line: start_line,
                source,
            })?;
            let mut decl = RequirementDecl::from_pip(req);
            decl.resolve.clone_from(&self.resolve);
            let canonical = crate::requirement::canonicalize_name(&decl.name);
            decl.modules = self
                .module_mapping
                .iter()
                .find(|(k, _)| crate::requirement::canonicalize_name(k) == canonical)
                .map(|(_, v)| v.clone());
            decl.type_stub_modules = self
                .type_stubs_module_mapping
                .iter()
                .find(|(k, _)| crate::requirement::canonicalize_name(k) == canonical)
                .map(|(_, v)| v.clone());
            out.push(decl);
        }
        Ok(out)
    }
}

fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return "";
    }
    match trimmed.find(" #") {
        Some(idx) => trimmed[..idx].trim_end(),
        None => trimmed,
    }
}

/// A first-party compilation unit declaration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UnitDecl {
    pub address: String,
    /// Source file, relative to the config root, scanned for imports.
    #[serde(default)]
    pub source: Option<String>,
    /// Module this unit provides; derived from `source` when absent.
    #[serde(default)]
    pub module: Option<String>,
    /// Imports supplied directly instead of scanning `source`.
    #[serde(default)]
    pub imports: Option<Vec<String>>,
    #[serde(default)]
    pub resolve: Option<ResolveField>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_resolve_name() -> String {
    DEFAULT_RESOLVE_NAME.to_owned()
}

fn default_attempts() -> u32 {
    3
}

fn default_platforms() -> Vec<String> {
    vec!["linux".to_owned(), "mac".to_owned()]
}

fn default_python() -> String {
    "python3".to_owned()
}

pub fn parse_config_str(input: &str) -> Result<ConfigV1, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ConfigV1, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Directory that relative paths in a config file are resolved against.
pub fn config_root(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
