use crate::cancel::Cancellation;
use crate::BackendError;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, killing it if `cancel` fires first.
///
/// Output is captured in temporary files rather than pipes so a chatty child
/// cannot block on a full pipe while we poll.
pub fn run_cancellable(
    mut cmd: Command,
    cancel: &Cancellation,
) -> Result<ProcessOutput, BackendError> {
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled);
    }
    let mut stdout_file = tempfile::tempfile()?;
    let mut stderr_file = tempfile::tempfile()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file.try_clone()?))
        .stderr(Stdio::from(stderr_file.try_clone()?));

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackendError::BackendUnavailable(format!("'{program}' not found on PATH"))
        } else {
            BackendError::Io(e)
        }
    })?;
    tracing::debug!("spawned '{program}' (pid {})", child.id());

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_cancelled() {
            tracing::warn!("cancelling '{program}' (pid {})", child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(ProcessOutput {
        status,
        stdout: read_all(&mut stdout_file)?,
        stderr: read_all(&mut stderr_file)?,
    })
}

fn read_all(file: &mut fs::File) -> Result<String, std::io::Error> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn captures_output_and_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = run_cancellable(cmd, &Cancellation::new()).unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn cancellation_kills_child() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let start = Instant::now();
        let result = run_cancellable(cmd, &cancel);
        handle.join().unwrap();
        assert!(matches!(result, Err(BackendError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_unavailable() {
        let cmd = Command::new("reslock-definitely-not-a-real-program");
        assert!(matches!(
            run_cancellable(cmd, &Cancellation::new()),
            Err(BackendError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn already_cancelled_does_not_spawn() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let cmd = Command::new("true");
        assert!(matches!(
            run_cancellable(cmd, &cancel),
            Err(BackendError::Cancelled)
        ));
    }
}
