//! Sandbox runner trait and outcome values.
//!
//! Runners execute one code snapshot in an isolated process and report a
//! tagged outcome. Failures are values, never panics or errors thrown
//! across the async boundary — the worker maps each variant to a terminal
//! status.

mod docker;

pub use docker::DockerRunner;

use async_trait::async_trait;

/// Result of one sandboxed run attempt.
#[derive(Debug, Clone)]
pub enum SandboxOutcome {
    /// Process exited 0.
    Success {
        stdout: String,
        stderr: String,
        elapsed_ms: u64,
    },

    /// Process exited non-zero. `stderr` carries the captured error output
    /// or a fixed fallback message when the process produced none.
    RuntimeFailure { stderr: String, elapsed_ms: u64 },

    /// The execution ceiling expired and the process was killed. stdout is
    /// not guaranteed complete; only stderr captured so far is reported.
    Timeout {
        partial_stderr: String,
        elapsed_ms: u64,
    },

    /// The isolated process could not be spawned or managed (engine
    /// unavailable). Elapsed time is not meaningful. Eligible for a
    /// job-level retry.
    InfrastructureFailure { message: String },

    /// The requested runtime is not supported. No process was spawned.
    UnsupportedLanguage { language: String },
}

/// Spawns one isolated process per invocation and enforces the resource,
/// network and time limits around it.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Whether this runner can execute the given runtime identifier.
    /// Workers use this to fail fast without invoking [`Self::run`].
    fn supports(&self, language: &str) -> bool;

    /// Execute `code` and classify what happened.
    async fn run(&self, code: &str, language: &str) -> SandboxOutcome;
}
