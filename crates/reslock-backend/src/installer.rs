use crate::cancel::Cancellation;
use crate::subprocess::run_cancellable;
use crate::BackendError;
use reslock_schema::config::{InstallerKind, InstallerSection};
use reslock_schema::lockfile::PinnedPackage;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Materializes pinned packages into an environment directory.
///
/// Each package lives in `<target>/<canonical-name>/`, which lets a subset be
/// extracted from a larger environment by copying directories.
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    fn install(
        &self,
        packages: &[PinnedPackage],
        target: &Path,
        cancel: &Cancellation,
    ) -> Result<(), BackendError>;

    /// Copy `packages` out of an already-installed repository environment.
    fn extract(
        &self,
        repository: &Path,
        packages: &[PinnedPackage],
        target: &Path,
    ) -> Result<(), BackendError> {
        for pkg in packages {
            let name = pkg.canonical_name();
            let src = repository.join(&name);
            if !src.is_dir() {
                return Err(BackendError::InstallFailed(format!(
                    "{}=={} is missing from repository environment {}",
                    pkg.name,
                    pkg.version,
                    repository.display()
                )));
            }
            copy_dir_recursive(&src, &target.join(&name))?;
        }
        Ok(())
    }
}

/// Installs each package with `<python> -m pip install --no-deps --target`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    program: String,
    extra_args: Vec<String>,
}

impl PipInstaller {
    pub fn new(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    fn command_for(&self, pkg: &PinnedPackage, requirements_file: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-m", "pip", "install", "--no-deps", "--no-input", "--quiet"]);
        if !pkg.hashes.is_empty() {
            cmd.arg("--require-hashes");
        }
        cmd.arg("--target")
            .arg(dest)
            .arg("-r")
            .arg(requirements_file)
            .args(&self.extra_args);
        cmd
    }
}

impl Installer for PipInstaller {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn install(
        &self,
        packages: &[PinnedPackage],
        target: &Path,
        cancel: &Cancellation,
    ) -> Result<(), BackendError> {
        let workdir = tempfile::tempdir()?;
        for pkg in packages {
            let name = pkg.canonical_name();
            let requirements_file = workdir.path().join(format!("{name}.txt"));
            fs::write(&requirements_file, pin_line(pkg))?;
            let dest = target.join(&name);
            fs::create_dir_all(&dest)?;

            tracing::debug!("installing {}=={}", pkg.name, pkg.version);
            let cmd = self.command_for(pkg, &requirements_file, &dest);
            let output = run_cancellable(cmd, cancel)?;
            if !output.status.success() {
                return Err(BackendError::InstallFailed(format!(
                    "{} -m pip install {}=={} failed:\n{}",
                    self.program,
                    pkg.name,
                    pkg.version,
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

/// A single-package requirements line with its hashes.
fn pin_line(pkg: &PinnedPackage) -> String {
    let mut line = format!("{}=={}", pkg.name, pkg.version);
    for hash in &pkg.hashes {
        line.push_str(&format!(" --hash={hash}"));
    }
    line.push('\n');
    line
}

pub fn select_installer(section: &InstallerSection) -> Box<dyn Installer> {
    match section.backend {
        InstallerKind::Pip => Box::new(PipInstaller::new(
            section.program.clone(),
            section.args.clone(),
        )),
        InstallerKind::Mock => Box::new(crate::mock::MockInstaller::new()),
    }
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            fs::copy(src.join(link), &target).map(|_| ())?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
