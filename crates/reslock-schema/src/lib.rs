//! Configuration, requirement model, fingerprints, and lockfile formats for reslock.
//!
//! This crate defines the schema layer: TOML configuration parsing (`ConfigV1`),
//! the validated configuration (`NormalizedConfig`), requirement strings and
//! environment markers, the curated distribution-to-module table, deterministic
//! fingerprints, and the two interchangeable lockfile serializations
//! (`LockfileEntry`).

pub mod config;
pub mod default_mapping;
pub mod fingerprint;
pub mod lockfile;
pub mod marker;
pub mod normalize;
pub mod requirement;
pub mod types;

pub use config::{
    config_root, parse_config_file, parse_config_str, AmbiguityBehavior, ConfigError, ConfigV1,
    InstallerKind, InstallerSection, InvalidLockfileBehavior, RequirementDecl,
    RequirementsFileDecl, ResolveField, SolverBackendKind, SolverSection, UnitDecl,
    UnownedDependencyBehavior,
};
pub use default_mapping::{is_stdlib_module, DefaultModuleMapping};
pub use fingerprint::{closure_fingerprint, content_fingerprint, requirements_fingerprint};
pub use lockfile::{
    parse_lockfile, LockError, LockfileEntry, LockfileFormat, LockfileMetadata, ParsedLockfile,
    PinnedPackage, LOCKFILE_FORMAT_VERSION,
};
pub use marker::{Marker, MarkerEnvironment, MarkerError, TargetEnvironment};
pub use normalize::{InferencePolicy, NormalizedConfig, ResolveConfig};
pub use requirement::{canonicalize_name, PipRequirement, RequirementError, RequirementSource};
pub use types::{Address, Fingerprint, ModuleName, ResolveName};
