//! Materializing closures into cached, fingerprint-keyed environments.
//!
//! Each environment is installed at most once per fingerprint: callers racing
//! on one fingerprint serialize on an in-process keyed mutex and a file lock,
//! re-check the cache, and only the first installs. Installation happens in a
//! staging directory that is renamed into place on success.

use crate::concurrency::{lock_key, FileLock, KeyedLocks};
use crate::graph::Closure;
use crate::registry::RequirementRegistry;
use crate::CoreError;
use reslock_backend::{BackendError, Cancellation, InstallStrategy, Installer};
use reslock_schema::config::InvalidLockfileBehavior;
use reslock_schema::fingerprint::closure_fingerprint;
use reslock_schema::lockfile::{LockError, LockfileEntry, PinnedPackage};
use reslock_schema::normalize::ResolveConfig;
use reslock_schema::types::{Fingerprint, ResolveName};
use reslock_store::{EnvironmentKind, EnvironmentStore, InstalledEnvironment, LockfileStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `ensure_installed` will install for a closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub resolve: ResolveName,
    pub fingerprint: Fingerprint,
    pub lockfile: LockfileEntry,
    pub packages: Vec<PinnedPackage>,
    pub constraints: Vec<String>,
    /// Closure addresses, for error reports.
    pub closure: Vec<String>,
}

impl InstallPlan {
    pub fn pins(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect()
    }
}

pub struct InstallationPlanner {
    envs: EnvironmentStore,
    lockfiles: LockfileStore,
    installer: Arc<dyn Installer>,
    strategy: InstallStrategy,
    locks: Arc<KeyedLocks>,
    invalid_lockfile_behavior: InvalidLockfileBehavior,
    cancel: Cancellation,
}

impl InstallationPlanner {
    pub fn new(
        envs: EnvironmentStore,
        lockfiles: LockfileStore,
        installer: Arc<dyn Installer>,
        strategy: InstallStrategy,
        locks: Arc<KeyedLocks>,
        invalid_lockfile_behavior: InvalidLockfileBehavior,
        cancel: Cancellation,
    ) -> Self {
        Self {
            envs,
            lockfiles,
            installer,
            strategy,
            locks,
            invalid_lockfile_behavior,
            cancel,
        }
    }

    pub fn environments(&self) -> &EnvironmentStore {
        &self.envs
    }

    /// Compute the package subset and fingerprint for `closure` without installing.
    pub fn plan(
        &self,
        resolve: &ResolveConfig,
        registry: &RequirementRegistry,
        closure: &Closure,
    ) -> Result<InstallPlan, CoreError> {
        if closure.resolve != resolve.name {
            return Err(CoreError::MixedResolves {
                resolves: vec![closure.resolve.to_string(), resolve.name.to_string()],
            });
        }
        let entry = self
            .lockfiles
            .load(resolve)?
            .ok_or_else(|| CoreError::MissingLockfile {
                resolve: resolve.name.to_string(),
                path: self.lockfiles.path_for(resolve).display().to_string(),
            })?;

        let expected = registry.subset_fingerprint(resolve);
        if let Err(stale) =
            entry.verify_fresh(&expected, &registry.requirement_strings(&resolve.name))
        {
            match self.invalid_lockfile_behavior {
                InvalidLockfileBehavior::Error => return Err(stale.into()),
                InvalidLockfileBehavior::Warn => warn!("{stale}; proceeding anyway"),
            }
        }

        let mut roots = Vec::new();
        let mut constraints = resolve.interpreter_constraints.clone();
        for address in &closure.requirements {
            let req = registry
                .get(address)
                .ok_or_else(|| CoreError::UnknownAddress(address.to_string()))?;
            if let Some(markers) = &req.markers {
                constraints.push(format!("{}; {markers}", req.canonical_name()));
            }
            roots.push(req.canonical_name());
        }
        let packages: Vec<PinnedPackage> = match entry.subset(&roots) {
            Ok(subset) => subset.into_iter().cloned().collect(),
            Err(LockError::MissingPackage { resolve, name }) => {
                return Err(LockError::Stale {
                    resolve,
                    expected: expected.short().to_owned(),
                    found: entry.metadata.requirements_fingerprint.short().to_owned(),
                    detail: format!("'{name}' is required but not pinned in the lockfile"),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        let pins: Vec<String> = packages
            .iter()
            .map(|p| format!("{}=={}", p.canonical_name(), p.version))
            .collect();
        let fingerprint = closure_fingerprint(&pins, &constraints, &entry.fingerprint());
        let mut closure_addresses: Vec<String> = closure.roots.iter().map(ToString::to_string).collect();
        closure_addresses.extend(
            closure
                .requirements
                .iter()
                .filter(|a| !closure.roots.contains(a))
                .map(ToString::to_string),
        );
        Ok(InstallPlan {
            resolve: resolve.name.clone(),
            fingerprint,
            lockfile: entry,
            packages,
            constraints,
            closure: closure_addresses,
        })
    }

    /// Return the environment for `closure`, installing it if no cached copy exists.
    pub fn ensure_installed(
        &self,
        resolve: &ResolveConfig,
        registry: &RequirementRegistry,
        closure: &Closure,
    ) -> Result<InstalledEnvironment, CoreError> {
        let plan = self.plan(resolve, registry, closure)?;
        self.install_plan(&plan).map_err(|e| CoreError::Install {
            fingerprint: plan.fingerprint.to_string(),
            closure: plan.closure.clone(),
            source: Box::new(e),
        })
    }

    fn install_plan(&self, plan: &InstallPlan) -> Result<InstalledEnvironment, CoreError> {
        let lockfile_fingerprint = plan.lockfile.fingerprint();
        match self.strategy {
            InstallStrategy::Subset => self.ensure(
                &plan.fingerprint,
                EnvironmentKind::Subset,
                plan,
                &lockfile_fingerprint,
                |dir| self.installer.install(&plan.packages, dir, &self.cancel),
            ),
            InstallStrategy::FullMaterialize => {
                let repository = self.ensure(
                    &lockfile_fingerprint,
                    EnvironmentKind::Repository,
                    plan,
                    &lockfile_fingerprint,
                    |dir| {
                        self.installer
                            .install(&plan.lockfile.packages, dir, &self.cancel)
                    },
                )?;
                self.ensure(
                    &plan.fingerprint,
                    EnvironmentKind::Subset,
                    plan,
                    &lockfile_fingerprint,
                    |dir| {
                        self.installer
                            .extract(&repository.path, &plan.packages, dir)
                    },
                )
            }
        }
    }

    fn ensure<F>(
        &self,
        fingerprint: &Fingerprint,
        kind: EnvironmentKind,
        plan: &InstallPlan,
        lockfile_fingerprint: &Fingerprint,
        build: F,
    ) -> Result<InstalledEnvironment, CoreError>
    where
        F: FnOnce(&Path) -> Result<(), BackendError>,
    {
        if let Some(env) = self.envs.lookup(fingerprint)? {
            debug!("{kind} environment {} is cached", fingerprint.short());
            return Ok(env);
        }

        let key = self.locks.get(&format!("env:{fingerprint}"));
        let _guard = lock_key(&key);
        let _file_lock = FileLock::acquire(&self.envs.layout().env_lock_path(fingerprint))?;
        if let Some(env) = self.envs.lookup(fingerprint)? {
            debug!(
                "{kind} environment {} was installed concurrently",
                fingerprint.short()
            );
            return Ok(env);
        }

        let staged = self.envs.stage(fingerprint)?;
        build(staged.path())?;
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled.into());
        }
        let pins = match kind {
            EnvironmentKind::Subset => plan.pins(),
            EnvironmentKind::Repository => plan
                .lockfile
                .packages
                .iter()
                .map(|p| format!("{}=={}", p.name, p.version))
                .collect(),
        };
        let env = InstalledEnvironment::new(
            fingerprint.clone(),
            kind,
            plan.resolve.clone(),
            lockfile_fingerprint.clone(),
            pins,
        );
        let published = self.envs.publish(staged, env)?;
        info!(
            "installed {kind} environment {} for resolve '{}' ({} packages)",
            fingerprint.short(),
            plan.resolve,
            published.packages.len()
        );
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BuildGraph;
    use crate::registry::Requirement;
    use reslock_backend::MockInstaller;
    use reslock_schema::fingerprint::requirements_fingerprint;
    use reslock_schema::lockfile::{LockfileFormat, LockfileMetadata, LOCKFILE_FORMAT_VERSION};
    use reslock_store::StoreLayout;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        resolve: ResolveConfig,
        registry: Arc<RequirementRegistry>,
        lockfiles: LockfileStore,
        layout: StoreLayout,
    }

    fn pinned(name: &str, version: &str, deps: &[&str]) -> PinnedPackage {
        let mut pkg = PinnedPackage::new(name, version);
        pkg.dependencies = deps.iter().map(|d| (*d).to_owned()).collect();
        pkg
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let resolve = ResolveConfig {
            name: ResolveName::new("web"),
            lockfile: PathBuf::from("web.lock"),
            is_default: true,
            interpreter_constraints: vec!["CPython>=3.8".to_owned()],
        };
        let registry = Arc::new(
            RequirementRegistry::from_requirements(vec![
                Requirement::new("requests", &[], "web"),
                Requirement::new("flask", &[], "web"),
            ])
            .unwrap(),
        );
        let lockfiles = LockfileStore::new(dir.path());
        write_lockfile(&lockfiles, &resolve, &registry);
        let layout = StoreLayout::new(dir.path().join("store"));
        layout.initialize().unwrap();
        Fixture {
            _dir: dir,
            resolve,
            registry,
            lockfiles,
            layout,
        }
    }

    fn write_lockfile(lockfiles: &LockfileStore, resolve: &ResolveConfig, registry: &RequirementRegistry) {
        let requirements = registry.requirement_strings(&resolve.name);
        let metadata = LockfileMetadata {
            version: LOCKFILE_FORMAT_VERSION,
            resolve: resolve.name.clone(),
            requirements_fingerprint: requirements_fingerprint(
                &requirements,
                &resolve.interpreter_constraints,
            ),
            generated_with_requirements: requirements,
            interpreter_constraints: resolve.interpreter_constraints.clone(),
            backend: "mock".to_owned(),
        };
        let entry = LockfileEntry::new(
            metadata,
            vec![
                pinned("requests", "2.31.0", &["idna", "urllib3"]),
                pinned("idna", "3.4", &[]),
                pinned("urllib3", "2.0.7", &[]),
                pinned("flask", "3.0.0", &["werkzeug"]),
                pinned("werkzeug", "3.0.1", &[]),
            ],
        );
        lockfiles
            .publish(resolve, &entry, LockfileFormat::Structured)
            .unwrap();
    }

    fn planner(f: &Fixture, installer: Arc<dyn Installer>, strategy: InstallStrategy) -> InstallationPlanner {
        InstallationPlanner::new(
            EnvironmentStore::new(f.layout.clone()),
            f.lockfiles.clone(),
            installer,
            strategy,
            Arc::new(KeyedLocks::new()),
            InvalidLockfileBehavior::Error,
            Cancellation::new(),
        )
    }

    fn closure(f: &Fixture, roots: &[&str]) -> Closure {
        BuildGraph::construct(Arc::clone(&f.registry), Vec::new())
            .unwrap()
            .closure(roots)
            .unwrap()
    }

    #[test]
    fn installs_the_closure_subset_once() {
        let f = fixture();
        let installer = Arc::new(MockInstaller::new());
        let p = planner(&f, installer.clone(), InstallStrategy::Subset);
        let c = closure(&f, &["req:requests"]);

        let env = p.ensure_installed(&f.resolve, &f.registry, &c).unwrap();
        assert_eq!(
            env.packages,
            vec!["idna==3.4", "requests==2.31.0", "urllib3==2.0.7"]
        );
        assert!(env.path.join("requests/INSTALLED").is_file());
        assert!(!env.path.join("flask").exists());

        let again = p.ensure_installed(&f.resolve, &f.registry, &c).unwrap();
        assert_eq!(again.path, env.path);
        assert_eq!(installer.installs(), 1);
    }

    #[test]
    fn different_closures_get_different_fingerprints() {
        let f = fixture();
        let p = planner(&f, Arc::new(MockInstaller::new()), InstallStrategy::Subset);
        let a = p.plan(&f.resolve, &f.registry, &closure(&f, &["req:requests"])).unwrap();
        let b = p.plan(&f.resolve, &f.registry, &closure(&f, &["req:flask"])).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
        let a2 = p.plan(&f.resolve, &f.registry, &closure(&f, &["req:requests"])).unwrap();
        assert_eq!(a.fingerprint, a2.fingerprint);
    }

    #[test]
    fn full_materialize_extracts_from_repository() {
        let f = fixture();
        let installer = Arc::new(MockInstaller::new());
        let p = planner(&f, installer.clone(), InstallStrategy::FullMaterialize);
        let env = p
            .ensure_installed(&f.resolve, &f.registry, &closure(&f, &["req:flask"]))
            .unwrap();
        assert!(env.path.join("werkzeug/INSTALLED").is_file());
        assert!(!env.path.join("requests").exists());

        p.ensure_installed(&f.resolve, &f.registry, &closure(&f, &["req:requests"]))
            .unwrap();
        // The repository environment is installed once and reused.
        assert_eq!(installer.installs(), 1);
        assert_eq!(installer.packages_installed(), 5);
        let kinds: Vec<EnvironmentKind> = p
            .environments()
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.iter().filter(|k| **k == EnvironmentKind::Repository).count(), 1);
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn stale_lockfile_is_an_error_by_default() {
        let f = fixture();
        let changed = Arc::new(
            RequirementRegistry::from_requirements(vec![
                Requirement::new("requests", &[">=2.32"], "web"),
                Requirement::new("flask", &[], "web"),
            ])
            .unwrap(),
        );
        let p = planner(&f, Arc::new(MockInstaller::new()), InstallStrategy::Subset);
        let c = closure(&f, &["req:requests"]);
        let err = p.ensure_installed(&f.resolve, &changed, &c).unwrap_err();
        assert!(matches!(err, CoreError::Lock(LockError::Stale { .. })));
        assert!(err.to_string().contains("generate-lockfiles --resolve=web"));
    }

    #[test]
    fn stale_lockfile_warns_when_configured() {
        let f = fixture();
        let changed = Arc::new(
            RequirementRegistry::from_requirements(vec![
                Requirement::new("requests", &[">=2.32"], "web"),
                Requirement::new("flask", &[], "web"),
            ])
            .unwrap(),
        );
        let p = InstallationPlanner {
            invalid_lockfile_behavior: InvalidLockfileBehavior::Warn,
            ..planner(&f, Arc::new(MockInstaller::new()), InstallStrategy::Subset)
        };
        let c = closure(&f, &["req:requests"]);
        assert!(p.ensure_installed(&f.resolve, &changed, &c).is_ok());
    }

    #[test]
    fn unpinned_root_is_stale() {
        let f = fixture();
        let extra = Arc::new(
            RequirementRegistry::from_requirements(vec![
                Requirement::new("requests", &[], "web"),
                Requirement::new("flask", &[], "web"),
                Requirement::new("attrs", &[], "web"),
            ])
            .unwrap(),
        );
        let p = InstallationPlanner {
            invalid_lockfile_behavior: InvalidLockfileBehavior::Warn,
            ..planner(&f, Arc::new(MockInstaller::new()), InstallStrategy::Subset)
        };
        let c = BuildGraph::construct(Arc::clone(&extra), Vec::new())
            .unwrap()
            .closure(&["req:attrs"])
            .unwrap();
        let err = p.ensure_installed(&f.resolve, &extra, &c).unwrap_err();
        assert!(matches!(err, CoreError::Lock(LockError::Stale { .. })));
        assert!(err.to_string().contains("attrs"));
    }

    #[test]
    fn missing_lockfile_names_the_command() {
        let f = fixture();
        std::fs::remove_file(f.lockfiles.path_for(&f.resolve)).unwrap();
        let p = planner(&f, Arc::new(MockInstaller::new()), InstallStrategy::Subset);
        let err = p
            .ensure_installed(&f.resolve, &f.registry, &closure(&f, &["req:flask"]))
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingLockfile { .. }));
    }

    #[test]
    fn failed_install_carries_fingerprint_and_closure() {
        struct Broken;
        impl Installer for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn install(
                &self,
                _packages: &[PinnedPackage],
                target: &Path,
                _cancel: &Cancellation,
            ) -> Result<(), BackendError> {
                std::fs::write(target.join("partial"), "x")?;
                Err(BackendError::InstallFailed("disk on fire".to_owned()))
            }
        }
        let f = fixture();
        let p = planner(&f, Arc::new(Broken), InstallStrategy::Subset);
        let c = closure(&f, &["req:flask"]);
        let plan = p.plan(&f.resolve, &f.registry, &c).unwrap();
        let err = p.ensure_installed(&f.resolve, &f.registry, &c).unwrap_err();
        let CoreError::Install {
            fingerprint,
            closure,
            ..
        } = &err
        else {
            panic!("expected install error, got {err}");
        };
        assert_eq!(fingerprint, plan.fingerprint.as_str());
        assert_eq!(closure, &vec!["req:flask".to_owned()]);
        assert!(err.to_string().contains("disk on fire"));
        // Nothing was published and the staging directory was discarded.
        assert!(p.environments().lookup(&plan.fingerprint).unwrap().is_none());
        assert_eq!(
            std::fs::read_dir(f.layout.staging_dir()).unwrap().count(),
            0
        );
    }
}
