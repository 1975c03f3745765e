//! External command execution with a bounded timeout

use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Errors from running an external tool
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl ExecError {
    /// Command line that failed
    pub fn command(&self) -> &str {
        match self {
            ExecError::Spawn { command, .. }
            | ExecError::Failed { command, .. }
            | ExecError::Timeout { command, .. } => command,
        }
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

struct CommandLine<'a> {
    program: &'a str,
    args: &'a [String],
}

impl fmt::Display for CommandLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Run `program args...`, failing on non-zero exit or when `timeout` elapses.
///
/// The child is killed if the timeout fires; nothing is retried.
pub async fn run(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let command = CommandLine { program, args }.to_string();
    debug!("Running `{}`", command);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?,
        Err(_) => {
            error!("`{}` timed out after {:?}", command, timeout);
            return Err(ExecError::Timeout { command, timeout });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        error!("`{}` failed ({}): {}", command, output.status, stderr);
        return Err(ExecError::Failed {
            command,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}
