use crate::backend::{InstallStrategy, SolveOutput, SolveRequest, SolverBackend};
use crate::cancel::Cancellation;
use crate::installer::Installer;
use crate::BackendError;
use reslock_schema::lockfile::{LockfileFormat, PinnedPackage};
use reslock_schema::requirement::{canonicalize_name, PipRequirement};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MOCK_DEFAULT_VERSION: &str = "1.0.0";

/// A package known to the mock index.
#[derive(Debug, Clone, Default)]
pub struct MockPackage {
    /// Available versions; the last one is picked when unpinned.
    pub versions: Vec<String>,
    /// Declared requirements, as `name` or `name ; marker`.
    pub dependencies: Vec<String>,
}

/// Deterministic in-process solver.
///
/// Every requirement is pinned to its `==` version, or to the latest version
/// in the mock index, or to `1.0.0` for unknown packages. Declared
/// dependencies are followed transitively unless the package is listed as
/// omitted, which simulates a solver that drops a transitive dependency.
pub struct MockSolver {
    index: BTreeMap<String, MockPackage>,
    omitted: BTreeSet<String>,
    strategy: InstallStrategy,
    format: LockfileFormat,
    transport_failures: AtomicU32,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Mutex<BTreeMap<String, usize>>,
    max_in_flight_per_resolve: AtomicUsize,
}

impl Default for MockSolver {
    fn default() -> Self {
        Self {
            index: BTreeMap::new(),
            omitted: BTreeSet::new(),
            strategy: InstallStrategy::Subset,
            format: LockfileFormat::Structured,
            transport_failures: AtomicU32::new(0),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: Mutex::new(BTreeMap::new()),
            max_in_flight_per_resolve: AtomicUsize::new(0),
        }
    }
}

impl MockSolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_package(mut self, name: &str, versions: &[&str], dependencies: &[&str]) -> Self {
        self.index.insert(
            canonicalize_name(name),
            MockPackage {
                versions: versions.iter().map(|v| (*v).to_owned()).collect(),
                dependencies: dependencies.iter().map(|d| (*d).to_owned()).collect(),
            },
        );
        self
    }

    /// Leave `name` out of every solution while keeping edges that point to it.
    #[must_use]
    pub fn omitting(mut self, name: &str) -> Self {
        self.omitted.insert(canonicalize_name(name));
        self
    }

    /// Fail the next `n` invocations with a transport error.
    #[must_use]
    pub fn failing_transport(self, n: u32) -> Self {
        self.transport_failures.store(n, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: InstallStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LockfileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations observed for any single resolve.
    pub fn max_in_flight_per_resolve(&self) -> usize {
        self.max_in_flight_per_resolve.load(Ordering::SeqCst)
    }

    fn enter(&self, resolve: &str) -> Result<(), BackendError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|e| BackendError::InvalidOutput(format!("mutex poisoned: {e}")))?;
        let count = in_flight.entry(resolve.to_owned()).or_insert(0);
        *count += 1;
        self.max_in_flight_per_resolve
            .fetch_max(*count, Ordering::SeqCst);
        Ok(())
    }

    fn leave(&self, resolve: &str) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(count) = in_flight.get_mut(resolve) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn pick_version(&self, req: &PipRequirement) -> String {
        if let Some(pinned) = req.pinned_version() {
            return pinned.to_owned();
        }
        self.index
            .get(&canonicalize_name(&req.name))
            .and_then(|p| p.versions.last().cloned())
            .unwrap_or_else(|| MOCK_DEFAULT_VERSION.to_owned())
    }

    fn compute(&self, request: &SolveRequest<'_>) -> Result<Vec<PinnedPackage>, BackendError> {
        let mut pins: BTreeMap<String, PinnedPackage> = BTreeMap::new();
        let mut queue: Vec<(PipRequirement, String)> = Vec::new();
        for raw in request.requirements {
            let req = PipRequirement::parse(raw).map_err(|e| BackendError::Unsatisfiable {
                program: "mock".to_owned(),
                diagnostics: e.to_string(),
            })?;
            queue.push((req, raw.clone()));
        }

        while let Some((req, origin)) = queue.pop() {
            let canonical = canonicalize_name(&req.name);
            let version = self.pick_version(&req);
            if let Some(known) = self.index.get(&canonical) {
                if !known.versions.is_empty() && !known.versions.contains(&version) {
                    return Err(BackendError::Unsatisfiable {
                        program: "mock".to_owned(),
                        diagnostics: format!(
                            "could not find a version that satisfies the requirement {origin}"
                        ),
                    });
                }
            }
            if let Some(existing) = pins.get(&canonical) {
                if req.pinned_version().is_some() && existing.version != version {
                    return Err(BackendError::Unsatisfiable {
                        program: "mock".to_owned(),
                        diagnostics: format!(
                            "conflicting dependencies: {canonical}=={} and {origin}",
                            existing.version
                        ),
                    });
                }
                continue;
            }

            let mut pkg = PinnedPackage::new(&req.name, &version);
            pkg.markers.clone_from(&req.markers);
            pkg.hashes = vec![format!(
                "blake3:{}",
                blake3::hash(format!("{canonical}=={version}").as_bytes()).to_hex()
            )];
            if let Some(known) = self.index.get(&canonical) {
                for dep in &known.dependencies {
                    let dep_req =
                        PipRequirement::parse(dep).map_err(|e| BackendError::InvalidOutput(
                            format!("mock index entry for {canonical}: {e}"),
                        ))?;
                    pkg.dependencies.push(canonicalize_name(&dep_req.name));
                    queue.push((dep_req, format!("{dep} (required by {canonical})")));
                }
            }
            pins.insert(canonical, pkg);
        }

        Ok(pins
            .into_iter()
            .filter(|(name, _)| !self.omitted.contains(name))
            .map(|(_, pkg)| pkg)
            .collect())
    }
}

impl SolverBackend for MockSolver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn install_strategy(&self) -> InstallStrategy {
        self.strategy
    }

    fn solve(
        &self,
        request: &SolveRequest<'_>,
        cancel: &Cancellation,
    ) -> Result<SolveOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.enter(request.resolve)?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = if cancel.is_cancelled() {
            Err(BackendError::Cancelled)
        } else if self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(BackendError::Transport {
                program: "mock".to_owned(),
                diagnostics: "simulated connection reset".to_owned(),
            })
        } else {
            self.compute(request).map(|packages| SolveOutput {
                packages,
                format: self.format,
            })
        };
        self.leave(request.resolve);
        result
    }
}

/// Installer that writes a marker directory per package and counts installations.
#[derive(Debug, Default)]
pub struct MockInstaller {
    installs: AtomicUsize,
    packages_installed: AtomicUsize,
    delay: Duration,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `install` calls that ran to completion.
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn packages_installed(&self) -> usize {
        self.packages_installed.load(Ordering::SeqCst)
    }
}

impl Installer for MockInstaller {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn install(
        &self,
        packages: &[PinnedPackage],
        target: &Path,
        cancel: &Cancellation,
    ) -> Result<(), BackendError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        for pkg in packages {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            let dir = target.join(pkg.canonical_name());
            std::fs::create_dir_all(&dir)?;
            std::fs::write(
                dir.join("INSTALLED"),
                format!("{}=={}\n", pkg.name, pkg.version),
            )?;
        }
        self.packages_installed
            .fetch_add(packages.len(), Ordering::SeqCst);
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
