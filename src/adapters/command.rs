//! Bounded subprocess execution. Every external tool call goes through
//! [`run`], so nothing can hang past its timeout.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::trace;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr followed by stdout, for error classification.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.stderr, self.stdout)
    }
}

pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, CommandError> {
    trace!(program, ?args, "exec");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?,
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run`] for an owned argv whose first element is the program.
pub async fn run_argv(argv: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
    let Some((program, rest)) = argv.split_first() else {
        return Err(CommandError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        });
    };
    let args: Vec<&str> = rest.iter().map(String::as_str).collect();
    run(program, &args, timeout).await
}

/// Run and only care whether it worked.
pub async fn succeeds(program: &str, args: &[&str], timeout: Duration) -> bool {
    run(program, args, timeout).await.is_ok_and(|o| o.success)
}
