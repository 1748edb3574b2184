//! Core orchestration for reslock.
//!
//! This crate ties together configuration, the lockfile and environment
//! stores, and the solver and installer backends: the requirement registry,
//! resolve partitioning and validation, module mapping and dependency
//! inference, the build graph, the solver adapter and the installation
//! planner, plus the `Engine` facade over all of them.

pub mod concurrency;
pub mod engine;
pub mod graph;
pub mod imports;
pub mod infer;
pub mod install;
pub mod lifecycle;
pub mod mapper;
pub mod partition;
pub mod registry;
pub mod solve;
pub mod units;

pub use concurrency::{install_signal_handler, FileLock, KeyedLocks};
pub use engine::{AmbiguousModule, CheckReport, DependencyReport, Engine, ResolveReport};
pub use graph::{BuildGraph, Closure, GraphNode, NodeKind};
pub use imports::{ImportParser, ParsedImport, PythonImportScanner};
pub use infer::{Diagnostic, InferenceCache, InferenceEngine, InferredDependencies, Severity};
pub use install::{InstallPlan, InstallationPlanner};
pub use lifecycle::{validate_transition, SolveAttempt, SolveState};
pub use mapper::{ModuleMapper, ModuleOwner, ProvidedModules};
pub use partition::{ExpandedNode, ResolveViolation};
pub use registry::{Requirement, RequirementRegistry};
pub use solve::{SolveOutcome, SolverAdapter};
pub use units::Unit;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] reslock_schema::ConfigError),
    #[error("lockfile error: {0}")]
    Lock(#[from] reslock_schema::LockError),
    #[error("store error: {0}")]
    Store(#[from] reslock_store::StoreError),
    #[error("backend error: {0}")]
    Backend(#[from] reslock_backend::BackendError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("validation error: {}", format_violations(.0))]
    CrossResolve(Vec<ResolveViolation>),
    #[error("validation error: {from} depends on unknown address '{to}'")]
    UnknownDependency { from: String, to: String },
    #[error("validation error: unknown address '{0}'")]
    UnknownAddress(String),
    #[error("validation error: '{address}' is parametrized; use one of: {}", .candidates.join(", "))]
    AmbiguousAddress {
        address: String,
        candidates: Vec<String>,
    },
    #[error("validation error: address '{0}' is declared more than once")]
    DuplicateAddress(String),
    #[error("validation error: requirement '{name}' is declared twice in resolve '{resolve}' ({first}, {second})")]
    DuplicateRequirement {
        resolve: String,
        name: String,
        first: String,
        second: String,
    },
    #[error("validation error: closure roots span several resolves: {}", .resolves.join(", "))]
    MixedResolves { resolves: Vec<String> },
    #[error("validation error: no roots given")]
    EmptyClosure,
    #[error("validation error: {}", format_diagnostics(.0))]
    Inference(Vec<Diagnostic>),
    #[error("unknown resolve '{0}'")]
    UnknownResolve(String),
    #[error("invalid solve state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error(
        "resolve '{resolve}': package '{package}' depends on '{dependency}', which the solver \
         excluded under the resolve's target environments; add '{dependency}' as an explicit \
         requirement of resolve '{resolve}' and regenerate its lockfile"
    )]
    MissingTransitiveDependency {
        resolve: String,
        package: String,
        dependency: String,
    },
    #[error(
        "no lockfile for resolve '{resolve}' at {path}; run `reslock generate-lockfiles --resolve={resolve}`"
    )]
    MissingLockfile { resolve: String, path: String },
    #[error("failed to generate lockfile for resolve '{resolve}': {source}")]
    Solve {
        resolve: String,
        #[source]
        source: Box<CoreError>,
    },
    #[error("failed to install environment {fingerprint} for [{}]: {source}", .closure.join(", "))]
    Install {
        fingerprint: String,
        closure: Vec<String>,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Solve errors are annotated with their resolve.
    pub fn solve(resolve: &str, source: CoreError) -> Self {
        CoreError::Solve {
            resolve: resolve.to_owned(),
            source: Box::new(source),
        }
    }
}

fn format_violations(violations: &[ResolveViolation]) -> String {
    let lines: Vec<String> = violations.iter().map(ToString::to_string).collect();
    format!(
        "{} dependency edge(s) cross resolves:\n  {}",
        violations.len(),
        lines.join("\n  ")
    )
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let lines: Vec<String> = diagnostics.iter().map(ToString::to_string).collect();
    format!("dependency inference failed:\n  {}", lines.join("\n  "))
}
