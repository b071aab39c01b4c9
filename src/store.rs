//! Execution records and the record store.
//!
//! The store is pure data access: callers decide *what* to write, the store
//! only enforces the status state machine (`QUEUED → RUNNING → terminal`)
//! and the immutability of terminal records. No policy lives here.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle status of an execution.
///
/// Transitions only move forward: `Queued → Running → {Completed, Failed,
/// Timeout}`. A retry re-enters `Running`; terminal states have no outgoing
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further mutation.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// An active execution blocks new admissions for its session.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Running → Running` is the attempt re-entry case (job-level retry).
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued | Self::Running, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed | Self::Timeout)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// One run of a code snapshot, tracked through the status state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier, assigned at creation.
    pub id: String,

    /// Owning session. Immutable.
    pub session_ref: String,

    /// The exact source text submitted at admission time. Write-once —
    /// later edits to the session's working code never reach this field.
    pub code_snapshot: String,

    /// Runtime identifier (e.g. "python"). Immutable.
    pub language: String,

    pub status: ExecutionStatus,

    /// Captured output; remains `None` until a terminal transition.
    pub stdout: Option<String>,
    pub stderr: Option<String>,

    /// Wall-clock duration of the sandboxed run, set at the terminal
    /// transition. `None` when the run never produced a meaningful time
    /// (infrastructure failures, unsupported language).
    pub execution_time_ms: Option<u64>,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields for a new execution record. The store assigns `id`, `queued_at`
/// and the initial `Queued` status.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub session_ref: String,
    pub code_snapshot: String,
    pub language: String,
}

/// Partial update applied through [`ExecutionStore::update_fields`].
///
/// Output fields are doubly optional: the outer `Option` is "touch this
/// field at all", the inner is the stored value (attempt re-entry resets
/// output to `None`).
#[derive(Debug, Clone, Default)]
pub struct UpdateFields {
    pub status: Option<ExecutionStatus>,
    pub stdout: Option<Option<String>>,
    pub stderr: Option<Option<String>>,
    pub execution_time_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpdateFields {
    /// Update for entering `Running`: stamps `started_at` and wipes any
    /// partial output from a prior attempt.
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            stdout: Some(None),
            stderr: Some(None),
            started_at: Some(started_at),
            ..Self::default()
        }
    }

    /// Update for a terminal transition: status, captured output, elapsed
    /// time and `finished_at`, all in one write.
    pub fn terminal(
        status: ExecutionStatus,
        stdout: Option<String>,
        stderr: Option<String>,
        execution_time_ms: Option<u64>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(status),
            stdout: Some(stdout),
            stderr: Some(stderr),
            execution_time_ms,
            finished_at: Some(finished_at),
            ..Self::default()
        }
    }
}

/// Errors surfaced by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {id}")]
    NotFound { id: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution {id} is terminal ({status}) and immutable")]
    TerminalRecord {
        id: String,
        status: ExecutionStatus,
    },
}

/// Durable keyed storage for [`Execution`] entities.
///
/// `find_stale_running` exists for the recovery sweep: it lists `Running`
/// records whose attempt started before the given cutoff, so the sweeper
/// can finalize executions abandoned by a dead worker.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record with `status = Queued`. Returns the stored
    /// record with its assigned id.
    async fn create(&self, new: NewExecution) -> Result<Execution, StoreError>;

    async fn get(&self, id: &str) -> Result<Execution, StoreError>;

    /// Apply a partial update, enforcing the state machine.
    async fn update_fields(&self, id: &str, fields: UpdateFields) -> Result<Execution, StoreError>;

    /// Any execution owned by `session_ref` with an active status
    /// (`Queued` or `Running`).
    async fn find_active_by_session(
        &self,
        session_ref: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// `Running` records whose `started_at` is older than `older_than`.
    async fn find_stale_running(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError>;
}

/// In-memory store backed by a `RwLock`ed map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, Execution>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            session_ref: new.session_ref,
            code_snapshot: new.code_snapshot,
            language: new.language,
            status: ExecutionStatus::Queued,
            stdout: None,
            stderr: None,
            execution_time_ms: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let mut records = self.records.write().await;
        records.insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    async fn get(&self, id: &str) -> Result<Execution, StoreError> {
        let records = self.records.read().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update_fields(&self, id: &str, fields: UpdateFields) -> Result<Execution, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        if record.status.is_terminal() {
            return Err(StoreError::TerminalRecord {
                id: record.id.clone(),
                status: record.status,
            });
        }

        if let Some(next) = fields.status {
            if !record.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: record.status,
                    to: next,
                });
            }
            record.status = next;
        }
        if let Some(stdout) = fields.stdout {
            record.stdout = stdout;
        }
        if let Some(stderr) = fields.stderr {
            record.stderr = stderr;
        }
        if let Some(elapsed) = fields.execution_time_ms {
            record.execution_time_ms = Some(elapsed);
        }
        if let Some(started_at) = fields.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(finished_at) = fields.finished_at {
            record.finished_at = Some(finished_at);
        }

        Ok(record.clone())
    }

    async fn find_active_by_session(
        &self,
        session_ref: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| r.session_ref == session_ref && r.status.is_active())
            .cloned())
    }

    async fn find_stale_running(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| {
                r.status == ExecutionStatus::Running
                    && r.started_at.is_some_and(|t| t < older_than)
            })
            .cloned()
            .collect())
    }
}
