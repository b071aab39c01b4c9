//! Typed submit/poll surface.
//!
//! Thin adapters over the admission controller and the record store,
//! shaped like the HTTP contract (202/409/429 on submit, 200 on poll) but
//! expressed as serde-serializable values so the transport layer stays an
//! external concern.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::admission::{AdmissionController, AdmissionResult};
use crate::store::{Execution, ExecutionStatus, ExecutionStore, StoreError};

/// Response to a run submission.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    /// 202 — the execution was created and queued.
    Accepted {
        execution_id: String,
        status: ExecutionStatus,
    },

    /// 409 — the session already owns an active execution.
    Conflict {
        execution_id: String,
        status: ExecutionStatus,
        message: String,
    },

    /// 429 — the session exhausted its submission window.
    RateLimited { message: String, retry_after: u64 },
}

impl SubmitResponse {
    /// HTTP status code this response maps to.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Accepted { .. } => 202,
            Self::Conflict { .. } => 409,
            Self::RateLimited { .. } => 429,
        }
    }
}

/// Poll view of an execution (200 body of `getExecution`).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<u64>,
}

impl From<Execution> for ExecutionView {
    fn from(execution: Execution) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status,
            stdout: execution.stdout,
            stderr: execution.stderr,
            execution_time_ms: execution.execution_time_ms,
        }
    }
}

/// Facade wiring admission and polling together for a transport adapter.
pub struct ExecutionService {
    admission: Arc<AdmissionController>,
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionService {
    pub fn new(admission: Arc<AdmissionController>, store: Arc<dyn ExecutionStore>) -> Self {
        Self { admission, store }
    }

    /// `submitRun(session_ref, code)` — never waits for the sandbox.
    pub async fn submit_run(&self, session_ref: &str, code: &str) -> Result<SubmitResponse> {
        let response = match self.admission.admit(session_ref, code).await? {
            AdmissionResult::Admitted { execution_id } => SubmitResponse::Accepted {
                execution_id,
                status: ExecutionStatus::Queued,
            },
            AdmissionResult::DuplicateInProgress {
                existing_execution_id,
                existing_status,
            } => SubmitResponse::Conflict {
                message: format!(
                    "An execution is already in progress for this session ({existing_status})"
                ),
                execution_id: existing_execution_id,
                status: existing_status,
            },
            AdmissionResult::RateLimited {
                retry_after_seconds,
            } => SubmitResponse::RateLimited {
                message: "Too many submissions for this session, slow down".to_string(),
                retry_after: retry_after_seconds,
            },
        };
        Ok(response)
    }

    /// `getExecution(execution_id)` — read-only poll. `None` when the id
    /// is unknown (the 404 case).
    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionView>> {
        match self.store.get(execution_id).await {
            Ok(execution) => Ok(Some(execution.into())),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
