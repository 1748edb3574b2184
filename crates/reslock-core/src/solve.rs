//! Generating lockfiles: one backend invocation per resolve, serialized per
//! resolve and published atomically.

use crate::concurrency::{lock_key, FileLock, KeyedLocks};
use crate::lifecycle::{SolveAttempt, SolveState};
use crate::registry::RequirementRegistry;
use crate::CoreError;
use reslock_backend::{BackendError, Cancellation, SolveRequest, SolverBackend};
use reslock_schema::lockfile::{
    LockfileEntry, LockfileFormat, LockfileMetadata, PinnedPackage, LOCKFILE_FORMAT_VERSION,
};
use reslock_schema::marker::{Marker, TargetEnvironment};
use reslock_schema::normalize::{NormalizedConfig, ResolveConfig};
use reslock_schema::requirement::canonicalize_name;
use reslock_schema::types::ResolveName;
use reslock_store::{LockfileStore, StoreLayout};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub resolve: ResolveName,
    pub path: PathBuf,
    pub entry: LockfileEntry,
    pub format: LockfileFormat,
    pub attempts: u32,
}

pub struct SolverAdapter {
    backend: Arc<dyn SolverBackend>,
    lockfiles: LockfileStore,
    layout: StoreLayout,
    locks: Arc<KeyedLocks>,
    attempts: u32,
    platforms: Vec<String>,
    target_environments: Vec<TargetEnvironment>,
    cancel: Cancellation,
}

impl SolverAdapter {
    pub fn new(
        backend: Arc<dyn SolverBackend>,
        lockfiles: LockfileStore,
        layout: StoreLayout,
        config: &NormalizedConfig,
        locks: Arc<KeyedLocks>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            backend,
            lockfiles,
            layout,
            locks,
            attempts: config.solver.attempts.max(1),
            platforms: config.solver.platforms.clone(),
            target_environments: config.target_environments.clone(),
            cancel,
        }
    }

    pub fn backend(&self) -> &dyn SolverBackend {
        self.backend.as_ref()
    }

    /// Solve one resolve's requirement subset and publish its lockfile.
    ///
    /// Errors are annotated with the resolve name. Nothing is written unless
    /// the solve succeeds.
    pub fn solve(
        &self,
        resolve: &ResolveConfig,
        registry: &RequirementRegistry,
    ) -> Result<SolveOutcome, CoreError> {
        let mut attempt = SolveAttempt::new(resolve.name.clone());
        let result = self.run(&mut attempt, resolve, registry);
        let terminal = if result.is_ok() {
            SolveState::Succeeded
        } else {
            SolveState::Failed
        };
        if attempt.state() == SolveState::Solving {
            attempt.transition(terminal)?;
        }
        result.map_err(|e| CoreError::solve(&resolve.name, e))
    }

    fn run(
        &self,
        attempt: &mut SolveAttempt,
        resolve: &ResolveConfig,
        registry: &RequirementRegistry,
    ) -> Result<SolveOutcome, CoreError> {
        let requirements = registry.requirement_strings(&resolve.name);
        let fingerprint = registry.subset_fingerprint(resolve);

        let key = self.locks.get(&format!("resolve:{}", resolve.name));
        let _guard = lock_key(&key);
        let _file_lock = FileLock::acquire(&self.layout.resolve_lock_path(&resolve.name))?;

        let request = SolveRequest {
            resolve: &resolve.name,
            requirements: &requirements,
            interpreter_constraints: &resolve.interpreter_constraints,
            platforms: &self.platforms,
        };
        info!(
            "solving resolve '{}' ({} requirements) with {}",
            resolve.name,
            requirements.len(),
            self.backend.name()
        );
        let output = loop {
            attempt.transition(SolveState::Solving)?;
            match self.backend.solve(&request, &self.cancel) {
                Ok(output) => break output,
                Err(e)
                    if e.is_retryable()
                        && attempt.attempts() < self.attempts
                        && !self.cancel.is_cancelled() =>
                {
                    warn!(
                        "resolve '{}': attempt {}/{} failed, retrying: {e}",
                        resolve.name,
                        attempt.attempts(),
                        self.attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };

        check_transitive(&resolve.name, &output.packages, &self.target_environments)?;

        let metadata = LockfileMetadata {
            version: LOCKFILE_FORMAT_VERSION,
            resolve: resolve.name.clone(),
            requirements_fingerprint: fingerprint,
            generated_with_requirements: requirements.clone(),
            interpreter_constraints: resolve.interpreter_constraints.clone(),
            backend: self.backend.name().to_owned(),
        };
        let entry = LockfileEntry::new(metadata, output.packages);
        let format = self
            .lockfiles
            .existing_format(resolve)
            .unwrap_or(output.format);
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled.into());
        }
        let path = self.lockfiles.publish(resolve, &entry, format)?;
        debug!(
            "resolve '{}': {} packages, fingerprint {}",
            resolve.name,
            entry.packages.len(),
            entry.metadata.requirements_fingerprint.short()
        );
        Ok(SolveOutcome {
            resolve: resolve.name.clone(),
            path,
            entry,
            format,
            attempts: attempt.attempts(),
        })
    }

    /// Solve several resolves in parallel, one thread each.
    pub fn solve_all(
        &self,
        resolves: &[&ResolveConfig],
        registry: &RequirementRegistry,
    ) -> Vec<(ResolveName, Result<SolveOutcome, CoreError>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = resolves
                .iter()
                .map(|resolve| {
                    let resolve = *resolve;
                    (
                        resolve.name.clone(),
                        scope.spawn(move || self.solve(resolve, registry)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(CoreError::solve(
                            &name,
                            CoreError::Io(std::io::Error::other("solver thread panicked")),
                        ))
                    });
                    (name, result)
                })
                .collect()
        })
    }
}

/// Every dependency edge of a package that applies to some target environment
/// must point at a package in the solved set.
pub fn check_transitive(
    resolve: &str,
    packages: &[PinnedPackage],
    targets: &[TargetEnvironment],
) -> Result<(), CoreError> {
    let solved: BTreeSet<String> = packages.iter().map(PinnedPackage::canonical_name).collect();
    for pkg in packages {
        if let Some(markers) = &pkg.markers {
            let marker = Marker::parse(markers)
                .map_err(|e| BackendError::InvalidOutput(format!("{}: {e}", pkg.name)))?;
            if !marker.applies_to_any(targets) {
                continue;
            }
        }
        for dep in &pkg.dependencies {
            if !solved.contains(&canonicalize_name(dep)) {
                return Err(CoreError::MissingTransitiveDependency {
                    resolve: resolve.to_owned(),
                    package: pkg.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Requirement;
    use reslock_backend::MockSolver;
    use reslock_schema::config::parse_config_str;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: NormalizedConfig,
        lockfiles: LockfileStore,
        layout: StoreLayout,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config_str(
            r#"
config_version = 1
default_resolve = "a"
[resolves.a]
lockfile = "locks/a.lock"
[resolves.b]
lockfile = "locks/b.lock"
[solver]
backend = "mock"
attempts = 3
"#,
        )
        .unwrap()
        .normalize()
        .unwrap();
        let lockfiles = LockfileStore::new(dir.path().join("repo"));
        let layout = StoreLayout::new(dir.path().join("store"));
        Fixture {
            _dir: dir,
            config,
            lockfiles,
            layout,
        }
    }

    fn adapter(f: &Fixture, backend: Arc<dyn SolverBackend>) -> SolverAdapter {
        SolverAdapter::new(
            backend,
            f.lockfiles.clone(),
            f.layout.clone(),
            &f.config,
            Arc::new(KeyedLocks::new()),
            Cancellation::new(),
        )
    }

    fn registry() -> RequirementRegistry {
        RequirementRegistry::from_requirements(vec![
            Requirement::new("requests", &["==2.31.0"], "a"),
            Requirement::new("flask", &[], "b"),
        ])
        .unwrap()
    }

    fn index() -> MockSolver {
        MockSolver::new()
            .with_package("requests", &["2.31.0"], &["idna", "urllib3"])
            .with_package("idna", &["3.4"], &[])
            .with_package("urllib3", &["1.26.18", "2.0.7"], &[])
    }

    #[test]
    fn solve_publishes_round_trippable_lockfile() {
        let f = fixture();
        let solver = adapter(&f, Arc::new(index()));
        let reg = registry();
        let resolve = f.config.resolve("a").unwrap();
        let outcome = solver.solve(resolve, &reg).unwrap();
        assert_eq!(outcome.attempts, 1);
        let names: Vec<String> = outcome.entry.packages.iter().map(PinnedPackage::canonical_name).collect();
        assert_eq!(names, vec!["idna", "requests", "urllib3"]);

        let loaded = f.lockfiles.load(resolve).unwrap().unwrap();
        assert_eq!(loaded, outcome.entry);
        assert_eq!(loaded.metadata.requirements_fingerprint, reg.subset_fingerprint(resolve));
        assert_eq!(loaded.metadata.backend, "mock");
        assert!(!f.lockfiles.path_for(f.config.resolve("b").unwrap()).exists());
    }

    #[test]
    fn transport_failures_are_retried() {
        let f = fixture();
        let backend = Arc::new(index().failing_transport(2));
        let solver = adapter(&f, backend.clone());
        let outcome = solver.solve(f.config.resolve("a").unwrap(), &registry()).unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn transport_failures_give_up_after_attempts() {
        let f = fixture();
        let backend = Arc::new(index().failing_transport(5));
        let solver = adapter(&f, backend.clone());
        let resolve = f.config.resolve("a").unwrap();
        let err = solver.solve(resolve, &registry()).unwrap_err();
        assert_eq!(backend.calls(), 3);
        assert!(err.to_string().contains("resolve 'a'"));
        assert!(matches!(
            err,
            CoreError::Solve { ref source, .. }
                if matches!(**source, CoreError::Backend(BackendError::Transport { .. }))
        ));
        assert!(!f.lockfiles.path_for(resolve).exists());
    }

    #[test]
    fn unsatisfiable_is_not_retried() {
        let f = fixture();
        let backend = Arc::new(index());
        let solver = adapter(&f, backend.clone());
        let reg = RequirementRegistry::from_requirements(vec![Requirement::new(
            "requests",
            &["==9.9.9"],
            "a",
        )])
        .unwrap();
        let err = solver.solve(f.config.resolve("a").unwrap(), &reg).unwrap_err();
        assert_eq!(backend.calls(), 1);
        assert!(err.to_string().contains("requests==9.9.9"));
    }

    #[test]
    fn missing_transitive_dependency_is_detected() {
        let f = fixture();
        let solver = adapter(&f, Arc::new(index().omitting("idna")));
        let resolve = f.config.resolve("a").unwrap();
        let err = solver.solve(resolve, &registry()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'idna'"), "{message}");
        assert!(message.contains("explicit requirement"));
        assert!(!f.lockfiles.path_for(resolve).exists());
    }

    #[test]
    fn marker_excluded_packages_skip_the_transitive_check() {
        let mut pkg = PinnedPackage::new("pywin32-helper", "1.0");
        pkg.markers = Some("sys_platform == \"win32\"".to_owned());
        pkg.dependencies = vec!["pywin32".to_owned()];
        let targets = vec![TargetEnvironment::new("3.11", "linux")];
        assert!(check_transitive("a", &[pkg.clone()], &targets).is_ok());
        let windows = vec![TargetEnvironment::new("3.11", "win32")];
        assert!(check_transitive("a", &[pkg], &windows).is_err());
    }

    #[test]
    fn regeneration_keeps_existing_format() {
        let f = fixture();
        let resolve = f.config.resolve("a").unwrap();
        adapter(&f, Arc::new(index().with_format(LockfileFormat::Flat)))
            .solve(resolve, &registry())
            .unwrap();
        let outcome = adapter(&f, Arc::new(index()))
            .solve(resolve, &registry())
            .unwrap();
        assert_eq!(outcome.format, LockfileFormat::Flat);
    }

    #[test]
    fn solve_all_runs_every_resolve() {
        let f = fixture();
        let solver = adapter(&f, Arc::new(index()));
        let resolves: Vec<&ResolveConfig> = f.config.resolves.values().collect();
        let results = solver.solve_all(&resolves, &registry());
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        for resolve in resolves {
            assert!(f.lockfiles.path_for(resolve).exists());
        }
    }

    #[test]
    fn cancelled_solve_publishes_nothing() {
        let f = fixture();
        let cancel = Cancellation::new();
        cancel.cancel();
        let solver = SolverAdapter::new(
            Arc::new(index()),
            f.lockfiles.clone(),
            f.layout.clone(),
            &f.config,
            Arc::new(KeyedLocks::new()),
            cancel,
        );
        let resolve = f.config.resolve("a").unwrap();
        let err = solver.solve(resolve, &registry()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Solve { ref source, .. }
                if matches!(**source, CoreError::Backend(BackendError::Cancelled))
        ));
        assert!(!f.lockfiles.path_for(resolve).exists());
    }
}
