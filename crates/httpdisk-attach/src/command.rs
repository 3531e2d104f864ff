//! Host command execution with captured output, plus a bounded-duration guard.

use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use httpdisk_device::RetryPolicy;
use nix::errno::Errno;
use tokio::process::Command;

/// Executables that were just written can fail to start with ETXTBSY for a moment.
pub(crate) const SPAWN_RETRY: RetryPolicy = RetryPolicy::new(4, Duration::from_millis(20));

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{}` exited with {code}, expected {expected}: {}", .argv.join(" "), .stderr.trim())]
    Exit {
        code: i32,
        expected: i32,
        argv: Vec<String>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Exit code of a command that ran to completion, `-1` when it was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            Self::Spawn { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

/// Runs host utilities. Children are killed if the future running them is dropped, so wrapping a
/// call in [`with_timeout`] never leaks a process.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `argv` to completion and return its stdout when it exits with `expected_code`.
    pub async fn run<S: AsRef<str>>(
        &self,
        argv: &[S],
        expected_code: i32,
    ) -> Result<String, CommandError> {
        let argv: Vec<String> = argv.iter().map(|arg| arg.as_ref().to_owned()).collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            });
        };

        tracing::debug!(command = %argv.join(" "), "running host command");
        let output = SPAWN_RETRY
            .retry_async(
                |_| async move {
                    Command::new(program)
                        .args(args)
                        .stdin(Stdio::null())
                        .kill_on_drop(true)
                        .output()
                        .await
                },
                |err| err.raw_os_error() == Some(Errno::ETXTBSY as i32),
            )
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if code != expected_code {
            return Err(CommandError::Exit {
                code,
                expected: expected_code,
                argv,
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(stdout)
    }
}

/// Await `fut` for at most `duration`. On expiry the future is dropped, which aborts whatever it
/// was doing.
pub async fn with_timeout<F: Future>(duration: Duration, fut: F) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| TimeoutError(duration))
}
