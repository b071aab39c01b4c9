//! Docker-backed sandbox runner.
//!
//! One short-lived container per invocation: memory/CPU/pid ceilings, no
//! network, read-only root with a tmpfs scratch mount, removed on exit.
//! Code reaches the interpreter via stdin — never argv, never a shared
//! file — and the interpreter runs unbuffered so captured stdout reflects
//! every write.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{SandboxOutcome, SandboxRunner};
use crate::config::SandboxConfig;

/// Shown when a failed process produced no stderr of its own.
const RUNTIME_FAILURE_FALLBACK: &str = "Sandbox container failed to start or run.";

/// Runner that executes snapshots inside ephemeral Docker containers.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    config: SandboxConfig,
}

impl DockerRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.engine);
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg(format!("--memory={}m", self.config.memory_mb))
            .arg(format!("--cpus={}", self.config.cpus))
            .arg(format!("--pids-limit={}", self.config.pids_limit))
            .arg("--network=none")
            .arg("--read-only")
            .args(["--tmpfs", "/tmp"])
            .arg(&self.config.image)
            .args(["python", "-u"]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop: if this future is dropped (job-level abandon), the
            // container process must not outlive it.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    fn supports(&self, language: &str) -> bool {
        language.eq_ignore_ascii_case(&self.config.language)
    }

    #[instrument(skip(self, code), fields(language = %language, code_len = code.len()))]
    async fn run(&self, code: &str, language: &str) -> SandboxOutcome {
        if !self.supports(language) {
            return SandboxOutcome::UnsupportedLanguage {
                language: language.to_string(),
            };
        }

        // Elapsed time spans container startup through teardown.
        let start = Instant::now();

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                return SandboxOutcome::InfrastructureFailure {
                    message: format!("failed to spawn sandbox container: {e}"),
                }
            }
        };

        // Deliver the snapshot on stdin, then close it to signal EOF.
        let Some(mut stdin) = child.stdin.take() else {
            let _ = child.kill().await;
            return SandboxOutcome::InfrastructureFailure {
                message: "sandbox stdin pipe unavailable".to_string(),
            };
        };
        if let Err(e) = stdin.write_all(code.as_bytes()).await {
            let _ = child.kill().await;
            return SandboxOutcome::InfrastructureFailure {
                message: format!("failed to write code to sandbox stdin: {e}"),
            };
        }
        drop(stdin);

        let Some(stdout_pipe) = child.stdout.take() else {
            let _ = child.kill().await;
            return SandboxOutcome::InfrastructureFailure {
                message: "sandbox stdout pipe unavailable".to_string(),
            };
        };
        let Some(stderr_pipe) = child.stderr.take() else {
            let _ = child.kill().await;
            return SandboxOutcome::InfrastructureFailure {
                message: "sandbox stderr pipe unavailable".to_string(),
            };
        };

        // Drain pipes on their own tasks so the buffers survive a timeout:
        // killing the child closes the pipes and the reads complete with
        // whatever was captured up to that point.
        let stdout_task = drain(stdout_pipe);
        let stderr_task = drain(stderr_pipe);

        match tokio::time::timeout(self.config.timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                let elapsed_ms = elapsed_ms(start);
                let stdout = collect(stdout_task).await;
                let stderr = collect(stderr_task).await;
                debug!(exit_code = status.code().unwrap_or(-1), elapsed_ms, "Sandbox exited");

                if status.success() {
                    SandboxOutcome::Success {
                        stdout,
                        stderr,
                        elapsed_ms,
                    }
                } else {
                    SandboxOutcome::RuntimeFailure {
                        stderr: if stderr.is_empty() {
                            RUNTIME_FAILURE_FALLBACK.to_string()
                        } else {
                            stderr
                        },
                        elapsed_ms,
                    }
                }
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                SandboxOutcome::InfrastructureFailure {
                    message: format!("failed to wait for sandbox container: {e}"),
                }
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out sandbox container");
                }
                let elapsed_ms = elapsed_ms(start);
                // stderr completes once the kill closes the pipe; stdout is
                // not guaranteed complete on timeout, drop it.
                stdout_task.abort();
                let tail = collect(stderr_task).await;
                let partial_stderr = format!(
                    "Execution timed out after {} seconds.\n{tail}",
                    self.config.timeout_seconds
                );
                SandboxOutcome::Timeout {
                    partial_stderr,
                    elapsed_ms,
                }
            }
        }
    }
}

fn drain<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    String::from_utf8_lossy(&task.await.unwrap_or_default()).into_owned()
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
