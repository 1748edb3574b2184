//! Solver backends and package installers for reslock.
//!
//! This crate implements the execution layer: the pluggable `SolverBackend`
//! trait with subprocess-driven `eager-subset` and `full-materialize` backends
//! and a deterministic mock, the `Installer` trait with pip and mock
//! implementations, and cancellable subprocess execution.

pub mod backend;
pub mod cancel;
pub mod command;
pub mod installer;
pub mod mock;
pub mod subprocess;

pub use backend::{select_backend, InstallStrategy, SolveOutput, SolveRequest, SolverBackend};
pub use cancel::Cancellation;
pub use command::SubprocessBackend;
pub use installer::{select_installer, Installer, PipInstaller};
pub use mock::{MockInstaller, MockSolver};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("requirement set is unsatisfiable ({program}):\n{diagnostics}")]
    Unsatisfiable { program: String, diagnostics: String },
    #[error("transport failure running {program}:\n{diagnostics}")]
    Transport { program: String, diagnostics: String },
    #[error("solver produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("installation failed: {0}")]
    InstallFailed(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transport { .. })
    }
}
