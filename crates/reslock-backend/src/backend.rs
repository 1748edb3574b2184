use crate::cancel::Cancellation;
use crate::BackendError;
use reslock_schema::config::{SolverBackendKind, SolverSection};
use reslock_schema::lockfile::{LockfileFormat, PinnedPackage};

/// Input to one solver invocation: a resolve's requirement subset and its constraints.
#[derive(Debug, Clone, Copy)]
pub struct SolveRequest<'a> {
    pub resolve: &'a str,
    /// Requirement strings, one per registry entry in the resolve.
    pub requirements: &'a [String],
    pub interpreter_constraints: &'a [String],
    pub platforms: &'a [String],
}

/// The pinned packages a backend produced, and the format it produced them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOutput {
    pub packages: Vec<PinnedPackage>,
    pub format: LockfileFormat,
}

/// How the installation planner materializes packages from a backend's lockfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    /// Install just the closure's subset directly from the lockfile.
    Subset,
    /// Install the whole lockfile once into a repository environment, then
    /// extract subsets from it.
    FullMaterialize,
}

pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &str;

    fn install_strategy(&self) -> InstallStrategy;

    /// Solve the requirement subset into a fully pinned package set.
    ///
    /// Must not publish anything; the caller owns the lockfile path.
    fn solve(
        &self,
        request: &SolveRequest<'_>,
        cancel: &Cancellation,
    ) -> Result<SolveOutput, BackendError>;
}

pub fn select_backend(section: &SolverSection) -> Result<Box<dyn SolverBackend>, BackendError> {
    match section.backend {
        SolverBackendKind::EagerSubset => Ok(Box::new(
            crate::command::SubprocessBackend::eager_subset(section),
        )),
        SolverBackendKind::FullMaterialize => Ok(Box::new(
            crate::command::SubprocessBackend::full_materialize(section),
        )),
        SolverBackendKind::Mock => Ok(Box::new(crate::mock::MockSolver::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        for (kind, strategy) in [
            (SolverBackendKind::EagerSubset, InstallStrategy::Subset),
            (SolverBackendKind::FullMaterialize, InstallStrategy::FullMaterialize),
            (SolverBackendKind::Mock, InstallStrategy::Subset),
        ] {
            let section = SolverSection {
                backend: kind,
                ..SolverSection::default()
            };
            let backend = select_backend(&section).unwrap();
            assert_eq!(backend.name(), kind.as_str());
            assert_eq!(backend.install_strategy(), strategy);
        }
    }
}
