//! Allow-listed external command execution.
//!
//! Every process the engine spawns goes through [`CommandRunner`]: the
//! program must be on the allow-list, output is capped, the number of
//! concurrent processes is bounded by a semaphore, and a timed-out child is
//! killed and reaped before the call returns.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Raw result of one process run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Either stream exceeded the output cap and was cut.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("program not allowed: {0}")]
    NotAllowed(String),
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("I/O error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotAllowed(_) => "not_allowed",
            Self::NotFound(_) => "not_found",
            Self::Spawn { .. } => "spawn_failed",
            Self::TimedOut { .. } => "timeout",
            Self::Io { .. } => "io_error",
        }
    }
}

/// Executes allow-listed programs with timeout and output limits.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    allowed: Arc<HashSet<String>>,
    default_timeout: Duration,
    max_output: usize,
    slots: Arc<Semaphore>,
}

fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

/// Read a stream to the end, keeping at most `cap` bytes.
///
/// Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if room >= n {
            kept.extend_from_slice(&buf[..n]);
        } else {
            kept.extend_from_slice(&buf[..room]);
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

impl CommandRunner {
    pub fn new(
        allowed: impl IntoIterator<Item = String>,
        default_timeout: Duration,
        max_output: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            allowed: Arc::new(allowed.into_iter().collect()),
            default_timeout,
            max_output,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(program_name(program))
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run with the default timeout.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RunnerError> {
        self.run_with_timeout(program, args, self.default_timeout).await
    }

    /// Run `program` with `args`, bounded by `limit`.
    ///
    /// The timeout covers the wait for a process slot too.
    pub async fn run_with_timeout(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<CommandOutput, RunnerError> {
        let name = program_name(program);
        if !self.is_allowed(program) {
            warn!(program = %program, "refusing to run program outside allow-list");
            return Err(RunnerError::NotAllowed(program.to_string()));
        }

        let start = Instant::now();
        let timed_out = || RunnerError::TimedOut {
            program: program.to_string(),
            after: limit,
        };

        let _permit = match timeout(limit, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(RunnerError::Io {
                    program: program.to_string(),
                    source: std::io::Error::other("process slots closed"),
                });
            }
            Err(_) => {
                crate::metrics::record_daemon_command(name, "timeout", start.elapsed().as_secs_f64());
                return Err(timed_out());
            }
        };
        let remaining = limit.saturating_sub(start.elapsed());

        let mut child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                crate::metrics::record_daemon_command(name, "spawn_failed", start.elapsed().as_secs_f64());
                if e.kind() == std::io::ErrorKind::NotFound {
                    RunnerError::NotFound(program.to_string())
                } else {
                    RunnerError::Spawn {
                        program: program.to_string(),
                        source: e,
                    }
                }
            })?;

        crate::metrics::process_started();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output;

        let collect = async {
            let out = async {
                match stdout {
                    Some(s) => read_capped(s, cap).await,
                    None => Ok((Vec::new(), false)),
                }
            };
            let err = async {
                match stderr {
                    Some(s) => read_capped(s, cap).await,
                    None => Ok((Vec::new(), false)),
                }
            };
            let (out, err) = tokio::join!(out, err);
            let status = child.wait().await;
            (out, err, status)
        };

        let result = timeout(remaining, collect).await;
        let outcome = match result {
            Ok((out, err, status)) => {
                let io_err = |source| RunnerError::Io {
                    program: program.to_string(),
                    source,
                };
                let (stdout, out_cut) = out.map_err(io_err)?;
                let (stderr, err_cut) = err.map_err(io_err)?;
                let status = status.map_err(io_err)?;
                Ok(CommandOutput {
                    status: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    truncated: out_cut || err_cut,
                    elapsed: start.elapsed(),
                })
            }
            Err(_) => {
                // The collecting future owned the child's handles; reap it here.
                if let Err(e) = child.kill().await {
                    warn!(program = %program, error = %e, "failed to kill timed-out process");
                }
                Err(timed_out())
            }
        };
        crate::metrics::process_finished();

        let label = match &outcome {
            Ok(o) if o.success() => "ok",
            Ok(_) => "failed",
            Err(e) => e.error_code(),
        };
        crate::metrics::record_daemon_command(name, label, start.elapsed().as_secs_f64());
        if let Ok(ref o) = outcome {
            debug!(
                program = %name,
                status = ?o.status,
                truncated = o.truncated,
                elapsed_ms = o.elapsed.as_millis() as u64,
                "command finished"
            );
        }
        outcome
    }
}
