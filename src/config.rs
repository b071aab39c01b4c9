//! Service configuration.
//!
//! All knobs have defaults matching the reference deployment; overrides
//! come in as JSON through the `CODERUN_CONFIG` environment variable.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable holding the JSON configuration document.
pub const CONFIG_ENV_VAR: &str = "CODERUN_CONFIG";

/// Top-level configuration for the execution service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of workers pulling from the execution queue. Bounds the
    /// number of concurrent sandbox containers.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub job: JobConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            rate_limit: RateLimitConfig::default(),
            sandbox: SandboxConfig::default(),
            job: JobConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `CODERUN_CONFIG`, falling back to defaults
    /// when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(json) => Self::from_json(&json),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))
    }
}

/// Per-session submission rate limit.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,

    /// Submissions allowed per session per window.
    #[serde(default = "default_rate_capacity")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_rate_window(),
            max_requests: default_rate_capacity(),
        }
    }
}

impl RateLimitConfig {
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Limits applied to each sandbox container.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Container engine binary.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Container image providing the interpreter.
    #[serde(default = "default_image")]
    pub image: String,

    /// The single supported runtime identifier.
    #[serde(default = "default_language")]
    pub language: String,

    /// Memory ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU quota as a fraction of one core.
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Process/thread ceiling (fork-bomb containment).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Wall-clock ceiling on the run, in seconds.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            language: default_language(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            timeout_seconds: default_sandbox_timeout(),
        }
    }
}

impl SandboxConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Job-level retry and timeout policy.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Total attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Ceiling on one whole attempt (startup + run + teardown), seconds.
    /// Safety net against a hung container engine, independent of the
    /// sandbox execution ceiling.
    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,

    /// Interval between recovery sweeps for stale `RUNNING` records.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Age past which a `RUNNING` record counts as abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_seconds: default_job_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
            stale_after_seconds: default_stale_after(),
        }
    }
}

impl JobConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

const fn default_worker_pool_size() -> usize {
    4
}

const fn default_rate_window() -> u64 {
    60
}

const fn default_rate_capacity() -> u32 {
    10
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_language() -> String {
    "python".to_string()
}

const fn default_memory_mb() -> u64 {
    128
}

const fn default_cpus() -> f64 {
    0.5
}

const fn default_pids_limit() -> u32 {
    50
}

const fn default_sandbox_timeout() -> u64 {
    10
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_job_timeout() -> u64 {
    60
}

const fn default_sweep_interval() -> u64 {
    60
}

const fn default_stale_after() -> u64 {
    90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_limits() {
        let config = Config::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.sandbox.memory_mb, 128);
        assert!((config.sandbox.cpus - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.sandbox.pids_limit, 50);
        assert_eq!(config.sandbox.timeout_seconds, 10);
        assert_eq!(config.sandbox.image, "python:3.12-slim");
        assert_eq!(config.job.max_attempts, 3);
        assert_eq!(config.job.timeout_seconds, 60);
    }

    #[test]
    fn partial_json_keeps_defaults_elsewhere() {
        let config = Config::from_json(
            r#"{
                "worker_pool_size": 2,
                "sandbox": { "timeout_seconds": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.sandbox.timeout_seconds, 5);
        // Untouched sections fall back to defaults
        assert_eq!(config.sandbox.memory_mb, 128);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.job.max_attempts, 3);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Config::from_json("not json").is_err());
    }
}
