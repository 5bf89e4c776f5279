use crate::driver::{ControlPlaneHandle, ExitStatusInfo};
use crate::GuestError;
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Run a host command to completion, failing on a non-zero exit.
pub fn run(program: &str, args: &[&str]) -> Result<(), GuestError> {
    debug!("+ {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(GuestError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a host command to completion, capturing stdout.
pub fn run_capture(program: &str, args: &[&str]) -> Result<String, GuestError> {
    debug!("+ {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(GuestError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Spawn a long-running host command, returning a control-plane handle.
pub fn spawn(program: &str, args: &[&str]) -> Result<Box<dyn ControlPlaneHandle>, GuestError> {
    debug!("spawning {program} {}", args.join(" "));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(Box::new(ChildHandle { child }))
}

struct ChildHandle {
    child: Child,
}

impl ControlPlaneHandle for ChildHandle {
    fn wait(&mut self) -> Result<ExitStatusInfo, GuestError> {
        let status = self.child.wait()?;
        Ok(exit_status_info(status))
    }

    fn kill(&mut self) -> Result<(), GuestError> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn exit_status_info(status: std::process::ExitStatus) -> ExitStatusInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitStatusInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_status_info(status: std::process::ExitStatus) -> ExitStatusInfo {
    ExitStatusInfo {
        code: status.code(),
        signal: None,
    }
}
