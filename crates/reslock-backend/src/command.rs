//! Solver backends that shell out to an external lockfile generator.
//!
//! The program is invoked with its argument template, where `{output}`,
//! `{requirements}` and `{resolve}` are substituted, followed by one
//! `--interpreter-constraint` pair per constraint and one `--target-system`
//! pair per platform. The requirement subset is written to `{requirements}`,
//! one requirement per line. On exit 0 the program must have written a
//! lockfile to `{output}` in either supported format.

use crate::backend::{InstallStrategy, SolveOutput, SolveRequest, SolverBackend};
use crate::cancel::Cancellation;
use crate::subprocess::run_cancellable;
use crate::BackendError;
use reslock_schema::config::{SolverBackendKind, SolverSection};
use reslock_schema::lockfile::parse_lockfile;
use std::fs;
use std::path::Path;
use std::process::Command;

const DEFAULT_PROGRAM: &str = "pex3";

const EAGER_SUBSET_ARGS: &[&str] = &[
    "lock",
    "create",
    "--output={output}",
    "--style=universal",
    "--resolver-version=pip-2020-resolver",
    "-r",
    "{requirements}",
];

const FULL_MATERIALIZE_ARGS: &[&str] = &[
    "lock",
    "create",
    "--output={output}",
    "--style=strict",
    "-r",
    "{requirements}",
];

const TRANSPORT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "timed out",
    "temporary failure in name resolution",
    "network is unreachable",
    "could not fetch",
    "max retries exceeded",
    "502 bad gateway",
    "503 service unavailable",
    "ssl error",
];

const UNSATISFIABLE_PATTERNS: &[&str] = &[
    "resolutionimpossible",
    "conflicting dependencies",
    "could not find a version that satisfies",
    "no matching distribution found",
    "unsatisfiable",
    "version solving failed",
];

#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    kind: SolverBackendKind,
    strategy: InstallStrategy,
    program: String,
    args: Vec<String>,
}

impl SubprocessBackend {
    pub fn eager_subset(section: &SolverSection) -> Self {
        Self::with_defaults(
            SolverBackendKind::EagerSubset,
            InstallStrategy::Subset,
            section,
            EAGER_SUBSET_ARGS,
        )
    }

    pub fn full_materialize(section: &SolverSection) -> Self {
        Self::with_defaults(
            SolverBackendKind::FullMaterialize,
            InstallStrategy::FullMaterialize,
            section,
            FULL_MATERIALIZE_ARGS,
        )
    }

    fn with_defaults(
        kind: SolverBackendKind,
        strategy: InstallStrategy,
        section: &SolverSection,
        default_args: &[&str],
    ) -> Self {
        Self {
            kind,
            strategy,
            program: section
                .program
                .clone()
                .unwrap_or_else(|| DEFAULT_PROGRAM.to_owned()),
            args: section.args.clone().unwrap_or_else(|| {
                default_args.iter().map(|s| (*s).to_owned()).collect()
            }),
        }
    }

    /// Build the full argument list for one invocation.
    pub fn render_args(
        &self,
        request: &SolveRequest<'_>,
        output: &Path,
        requirements: &Path,
    ) -> Vec<String> {
        let output = output.to_string_lossy();
        let requirements = requirements.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{requirements}", &requirements)
                    .replace("{resolve}", request.resolve)
            })
            .collect();
        for ic in request.interpreter_constraints {
            args.push("--interpreter-constraint".to_owned());
            args.push(ic.clone());
        }
        for platform in request.platforms {
            args.push("--target-system".to_owned());
            args.push(platform.clone());
        }
        args
    }
}

impl SolverBackend for SubprocessBackend {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn install_strategy(&self) -> InstallStrategy {
        self.strategy
    }

    fn solve(
        &self,
        request: &SolveRequest<'_>,
        cancel: &Cancellation,
    ) -> Result<SolveOutput, BackendError> {
        let workdir = tempfile::tempdir()?;
        let requirements_path = workdir.path().join("requirements.txt");
        let output_path = workdir.path().join("output.lock");
        let mut content = request.requirements.join("\n");
        content.push('\n');
        fs::write(&requirements_path, content)?;

        let args = self.render_args(request, &output_path, &requirements_path);
        tracing::debug!("{} {}", self.program, args.join(" "));
        let mut cmd = Command::new(&self.program);
        cmd.args(&args).current_dir(workdir.path());

        let output = run_cancellable(cmd, cancel)?;
        if !output.status.success() {
            return Err(classify_failure(
                &self.program,
                output.status.code(),
                &output.stderr,
            ));
        }

        let lockfile = fs::read_to_string(&output_path).map_err(|e| {
            BackendError::InvalidOutput(format!(
                "{} exited successfully but wrote no lockfile: {e}",
                self.program
            ))
        })?;
        let parsed = parse_lockfile(&lockfile)
            .map_err(|e| BackendError::InvalidOutput(format!("{}: {e}", self.program)))?;
        Ok(SolveOutput {
            packages: parsed.packages,
            format: parsed.format,
        })
    }
}

/// Map a failed solver exit into one of the failure causes.
///
/// A child killed by a signal is treated as a transport failure so it is retried.
pub fn classify_failure(program: &str, code: Option<i32>, stderr: &str) -> BackendError {
    let diagnostics = stderr.trim().to_owned();
    let lower = diagnostics.to_lowercase();
    if code.is_none() || TRANSPORT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return BackendError::Transport {
            program: program.to_owned(),
            diagnostics,
        };
    }
    if !UNSATISFIABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        tracing::debug!("unrecognized {program} failure, treating as unsatisfiable");
    }
    BackendError::Unsatisfiable {
        program: program.to_owned(),
        diagnostics,
    }
}
