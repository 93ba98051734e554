//! Subprocess plumbing shared by simulator control, the frame transport
//! and the thunk compiler.

use std::{process::ExitStatus, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{BackendError, Result};

/// Grace period between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Timeout applied to simulator control commands.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminate a child gracefully: SIGTERM, then SIGKILL once [`TERM_GRACE`]
/// elapses. Returns the final exit status description.
pub async fn terminate(child: &mut Child) -> String {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a live child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(status) => return describe_exit(status),
            Err(_) => {
                debug!(pid, "child ignored SIGTERM, escalating to SIGKILL");
                let _ = child.start_kill();
            }
        }
    }
    describe_exit(child.wait().await)
}

/// Run a command to completion, killing it if `timeout` elapses.
///
/// # Errors
///
/// [`BackendError::Io`] on spawn failure or timeout; callers map exit
/// status and output themselves.
pub async fn output_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<std::process::Output> {
    command.kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("command did not finish within {timeout:?}"),
        ))),
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => exit_status_string(status),
        Err(err) => err.to_string(),
    }
}

/// Human-readable exit description carried on `StreamStopped.diagnostic`.
#[must_use]
pub fn exit_status_string(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        match signal {
            libc::SIGKILL => "signal: killed".to_string(),
            libc::SIGTERM => "signal: terminated".to_string(),
            other => format!("signal: {other}"),
        }
    } else {
        match status.code() {
            Some(code) => format!("exit code: {code}"),
            None => "exited".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use super::exit_status_string;

    #[test]
    fn signals_are_named() {
        assert_eq!(
            exit_status_string(ExitStatus::from_raw(libc::SIGKILL)),
            "signal: killed"
        );
        assert_eq!(
            exit_status_string(ExitStatus::from_raw(libc::SIGTERM)),
            "signal: terminated"
        );
    }

    #[test]
    fn exit_codes_are_reported() {
        // Wait status encoding: exit code in the high byte.
        assert_eq!(exit_status_string(ExitStatus::from_raw(3 << 8)), "exit code: 3");
        assert_eq!(exit_status_string(ExitStatus::from_raw(0)), "exit code: 0");
    }
}
