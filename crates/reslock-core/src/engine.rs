use crate::concurrency::KeyedLocks;
use crate::graph::{BuildGraph, NodeKind};
use crate::imports::PythonImportScanner;
use crate::infer::{Diagnostic, InferenceCache, InferenceEngine, Severity};
use crate::install::{InstallPlan, InstallationPlanner};
use crate::mapper::ModuleMapper;
use crate::registry::RequirementRegistry;
use crate::solve::{SolveOutcome, SolverAdapter};
use crate::units::load_units;
use crate::CoreError;
use reslock_backend::{select_backend, select_installer, Cancellation, Installer, SolverBackend};
use reslock_schema::config::{config_root, parse_config_file, InvalidLockfileBehavior};
use reslock_schema::normalize::{NormalizedConfig, ResolveConfig};
use reslock_schema::types::{Address, ResolveName};
use reslock_store::{
    EnvironmentStore, InstalledEnvironment, LockfileStatus, LockfileStore, StoreLayout,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Central orchestration for one configuration file and one store.
///
/// Loading builds the requirement registry, the module mapper, the unit
/// graph and every unit's inferred edges up front; the graph is read-only
/// afterwards, so the same engine serves lockfile generation, checks and
/// installs.
pub struct Engine {
    config: NormalizedConfig,
    root: PathBuf,
    layout: StoreLayout,
    lockfiles: LockfileStore,
    registry: Arc<RequirementRegistry>,
    mapper: Arc<ModuleMapper>,
    graph: BuildGraph,
    cache: InferenceCache,
    diagnostics: Vec<Diagnostic>,
    solver: SolverAdapter,
    planner: InstallationPlanner,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub name: ResolveName,
    pub lockfile: PathBuf,
    pub is_default: bool,
    pub interpreter_constraints: Vec<String>,
    pub requirements: usize,
    pub fingerprint: String,
    pub status: String,
    /// Fingerprint recorded in a stale lockfile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousModule {
    pub resolve: ResolveName,
    pub module: String,
    pub candidates: Vec<Address>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub resolves: Vec<ResolveReport>,
    pub diagnostics: Vec<Diagnostic>,
    /// Modules claimed by several requirements of one resolve, imported or not.
    pub ambiguous_modules: Vec<AmbiguousModule>,
    /// Whether missing or stale lockfiles fail the check.
    pub lockfiles_required: bool,
}

impl CheckReport {
    pub fn error_count(&self) -> usize {
        let diagnostics = self
            .diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Error)
            .count();
        let lockfiles = if self.lockfiles_required {
            self.resolves.iter().filter(|r| r.status != "fresh").count()
        } else {
            0
        };
        diagnostics + lockfiles
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Warning)
            .count()
            + self.ambiguous_modules.len()
    }

    pub fn is_ok(&self) -> bool {
        self.error_count() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub address: Address,
    pub kind: NodeKind,
    pub resolve: ResolveName,
    pub explicit: Vec<Address>,
    pub excluded: Vec<Address>,
    pub inferred: Vec<Address>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Engine {
    /// Load `config_path` and open the store at `store_root`, selecting the
    /// solver and installer the configuration names.
    pub fn load(
        config_path: &Path,
        store_root: impl Into<PathBuf>,
        cancel: Cancellation,
    ) -> Result<Self, CoreError> {
        let config = parse_config_file(config_path)?.normalize()?;
        let backend: Arc<dyn SolverBackend> = Arc::from(select_backend(&config.solver)?);
        let installer: Arc<dyn Installer> = Arc::from(select_installer(&config.installer));
        Self::from_config(
            config,
            config_root(config_path),
            store_root,
            backend,
            installer,
            cancel,
        )
    }

    /// Build an engine from an already-normalized configuration.
    ///
    /// `root` is the directory lockfile, requirements-file and source paths
    /// are relative to.
    pub fn from_config(
        config: NormalizedConfig,
        root: impl Into<PathBuf>,
        store_root: impl Into<PathBuf>,
        backend: Arc<dyn SolverBackend>,
        installer: Arc<dyn Installer>,
        cancel: Cancellation,
    ) -> Result<Self, CoreError> {
        let root: PathBuf = root.into();
        let layout = StoreLayout::new(store_root);
        layout.initialize()?;
        let lockfiles = LockfileStore::new(&root);

        let registry = Arc::new(RequirementRegistry::load(&config, &root)?);
        let mapper = Arc::new(ModuleMapper::new(
            &registry,
            Arc::new(config.module_mapping.clone()),
        ));
        let units = load_units(&config, &root, &PythonImportScanner)?;
        let inference = InferenceEngine::new(
            &registry,
            Arc::clone(&mapper),
            &units,
            config.inference.clone(),
        );
        let mut graph = BuildGraph::construct(Arc::clone(&registry), units)?;

        let cache = InferenceCache::new();
        let inferred: Vec<_> = graph
            .units()
            .map(|unit| (unit.address.clone(), cache.get_or_infer(&inference, unit)))
            .collect();
        let mut diagnostics = Vec::new();
        for (address, deps) in inferred {
            graph.add_inferred(&address, &deps)?;
            diagnostics.extend(deps.diagnostics.iter().cloned());
        }
        info!(
            "loaded {} requirement(s) and {} unit(s) across {} resolve(s)",
            registry.len(),
            graph.units().count(),
            config.resolves.len()
        );
        debug!("{} inference diagnostic(s)", diagnostics.len());

        let locks = Arc::new(KeyedLocks::new());
        let strategy = backend.install_strategy();
        let solver = SolverAdapter::new(
            backend,
            lockfiles.clone(),
            layout.clone(),
            &config,
            Arc::clone(&locks),
            cancel.clone(),
        );
        let planner = InstallationPlanner::new(
            EnvironmentStore::new(layout.clone()),
            lockfiles.clone(),
            installer,
            strategy,
            locks,
            config.invalid_lockfile_behavior,
            cancel,
        );
        Ok(Self {
            config,
            root,
            layout,
            lockfiles,
            registry,
            mapper,
            graph,
            cache,
            diagnostics,
            solver,
            planner,
        })
    }

    pub fn config(&self) -> &NormalizedConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn registry(&self) -> &RequirementRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn inference_cache(&self) -> &InferenceCache {
        &self.cache
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn environments(&self) -> &EnvironmentStore {
        self.planner.environments()
    }

    fn resolve_config(&self, name: &str) -> Result<&ResolveConfig, CoreError> {
        self.config
            .resolve(name)
            .ok_or_else(|| CoreError::UnknownResolve(name.to_owned()))
    }

    pub fn resolves(&self) -> Result<Vec<ResolveReport>, CoreError> {
        let mut reports = Vec::new();
        for resolve in self.config.resolves.values() {
            let fingerprint = self.registry.subset_fingerprint(resolve);
            let status = self.lockfiles.status(resolve, &fingerprint)?;
            let found = match &status {
                LockfileStatus::Stale { found } => Some(found.to_string()),
                _ => None,
            };
            reports.push(ResolveReport {
                name: resolve.name.clone(),
                lockfile: self.lockfiles.path_for(resolve),
                is_default: resolve.is_default,
                interpreter_constraints: resolve.interpreter_constraints.clone(),
                requirements: self.registry.in_resolve(&resolve.name).count(),
                fingerprint: fingerprint.to_string(),
                status: status.to_string(),
                found,
            });
        }
        Ok(reports)
    }

    /// Generate lockfiles for `names`, or for every resolve when empty.
    ///
    /// Unknown names fail before anything is solved. Resolves are solved in
    /// parallel and each reports its own outcome.
    pub fn generate_lockfiles(
        &self,
        names: &[String],
    ) -> Result<Vec<(ResolveName, Result<SolveOutcome, CoreError>)>, CoreError> {
        let selected: Vec<&ResolveConfig> = if names.is_empty() {
            self.config.resolves.values().collect()
        } else {
            let mut selected = Vec::new();
            for name in names {
                let resolve = self.resolve_config(name)?;
                if !selected.iter().any(|r: &&ResolveConfig| r.name == resolve.name) {
                    selected.push(resolve);
                }
            }
            selected
        };
        Ok(self.solver.solve_all(&selected, &self.registry))
    }

    pub fn check(&self) -> Result<CheckReport, CoreError> {
        let mut ambiguous_modules = Vec::new();
        for name in self.config.resolves.keys() {
            for (module, candidates) in self.mapper.ambiguous_modules(name) {
                ambiguous_modules.push(AmbiguousModule {
                    resolve: name.clone(),
                    module: module.to_string(),
                    candidates,
                });
            }
        }
        Ok(CheckReport {
            resolves: self.resolves()?,
            diagnostics: self.diagnostics.clone(),
            ambiguous_modules,
            lockfiles_required: self.config.invalid_lockfile_behavior
                == InvalidLockfileBehavior::Error,
        })
    }

    pub fn dependencies(&self, address: &str) -> Result<DependencyReport, CoreError> {
        let node = self.graph.lookup(address)?;
        let diagnostics = self
            .diagnostics
            .iter()
            .filter(|d| d.unit() == &node.address)
            .cloned()
            .collect();
        Ok(DependencyReport {
            address: node.address.clone(),
            kind: node.kind,
            resolve: node.resolve.clone(),
            explicit: node.explicit.iter().cloned().collect(),
            excluded: node.excluded.iter().cloned().collect(),
            inferred: node
                .inferred
                .iter()
                .filter(|a| !node.explicit.contains(*a))
                .cloned()
                .collect(),
            diagnostics,
        })
    }

    /// Plan the environment for `roots` without installing it.
    pub fn plan<S: AsRef<str>>(&self, roots: &[S]) -> Result<InstallPlan, CoreError> {
        let closure = self.graph.closure(roots)?;
        let resolve = self.resolve_config(&closure.resolve)?;
        self.planner.plan(resolve, &self.registry, &closure)
    }

    /// Ensure the environment for the closure of `roots` exists.
    ///
    /// Error-level inference diagnostics on any unit in the closure block the
    /// install.
    pub fn install<S: AsRef<str>>(&self, roots: &[S]) -> Result<InstalledEnvironment, CoreError> {
        let closure = self.graph.closure(roots)?;
        let blocking: Vec<Diagnostic> = self
            .diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Error && closure.units.contains(d.unit()))
            .cloned()
            .collect();
        if !blocking.is_empty() {
            return Err(CoreError::Inference(blocking));
        }
        let resolve = self.resolve_config(&closure.resolve)?;
        self.planner
            .ensure_installed(resolve, &self.registry, &closure)
    }
}
