//! Admission control for run submissions.
//!
//! Gatekeeps every new run request: rate limit first, then duplicate
//! suppression, then record creation + enqueue. The duplicate check and
//! the create/enqueue pair run under a per-session lock so two concurrent
//! submissions for one session can never both pass the check — that race
//! would violate the one-active-execution-per-session invariant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::ExecutionQueue;
use crate::ratelimit::{FixedWindowLimiter, RateDecision};
use crate::session::SessionDirectory;
use crate::store::{ExecutionStatus, ExecutionStore, NewExecution};

/// Runtime used when the owning session does not name one.
pub const DEFAULT_LANGUAGE: &str = "python";

/// Synchronous answer to a run submission. Rejections never create a
/// record; execution-time failures surface later through polling.
#[derive(Debug, Clone)]
pub enum AdmissionResult {
    /// A record was persisted (`QUEUED`) and its id enqueued.
    Admitted { execution_id: String },

    /// The session already owns an active execution.
    DuplicateInProgress {
        existing_execution_id: String,
        existing_status: ExecutionStatus,
    },

    /// The session exhausted its submission window.
    RateLimited { retry_after_seconds: u64 },
}

/// Gatekeeper in front of the execution queue.
pub struct AdmissionController {
    store: Arc<dyn ExecutionStore>,
    sessions: Arc<dyn SessionDirectory>,
    limiter: FixedWindowLimiter,
    queue: Arc<ExecutionQueue>,
    /// Per-session admission lock. Held across duplicate check, create and
    /// enqueue; different sessions admit in parallel.
    admission_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        sessions: Arc<dyn SessionDirectory>,
        limiter: FixedWindowLimiter,
        queue: Arc<ExecutionQueue>,
    ) -> Self {
        Self {
            store,
            sessions,
            limiter,
            queue,
            admission_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the per-session admission lock.
    async fn admission_lock(&self, session_ref: &str) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.admission_locks.read().await;
            if let Some(lock) = locks.get(session_ref) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create
        let mut locks = self.admission_locks.write().await;
        Arc::clone(
            locks
                .entry(session_ref.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Admit a run request for `session_ref` with the submitted source.
    ///
    /// The submitted text is snapshotted into the record as-is; later
    /// edits to the session's working code do not affect it. At most one
    /// record is persisted and exactly one id enqueued per `Admitted`.
    pub async fn admit(&self, session_ref: &str, submitted_code: &str) -> Result<AdmissionResult> {
        // Rate check counts every submission, including ones that go on
        // to be rejected as duplicates.
        if let RateDecision::Limited { retry_after } = self.limiter.check(session_ref) {
            warn!(session = %session_ref, retry_after_secs = retry_after.as_secs(), "Submission rate limited");
            return Ok(AdmissionResult::RateLimited {
                retry_after_seconds: retry_after.as_secs().max(1),
            });
        }

        let lock = self.admission_lock(session_ref).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.find_active_by_session(session_ref).await? {
            info!(
                session = %session_ref,
                execution = %existing.id,
                status = %existing.status,
                "Duplicate submission suppressed"
            );
            return Ok(AdmissionResult::DuplicateInProgress {
                existing_execution_id: existing.id,
                existing_status: existing.status,
            });
        }

        let language = self
            .sessions
            .get(session_ref)
            .await
            .and_then(|s| s.language)
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let execution = self
            .store
            .create(NewExecution {
                session_ref: session_ref.to_string(),
                code_snapshot: submitted_code.to_string(),
                language,
            })
            .await
            .context("Failed to persist execution record")?;

        self.queue
            .enqueue(&execution.id)
            .context("Failed to enqueue execution")?;

        info!(session = %session_ref, execution = %execution.id, "Execution admitted");
        Ok(AdmissionResult::Admitted {
            execution_id: execution.id,
        })
    }

    /// Evict bookkeeping for quiet sessions: expired rate windows and
    /// admission locks for sessions with no active execution.
    ///
    /// A lock entry is removed only while the map's write lock is held and
    /// the entry's `Arc` has no other holder — no admission can be mid
    /// duplicate-check under it, and later admissions for the session all
    /// share whatever entry gets created next.
    pub async fn evict_idle(&self) {
        self.limiter.purge_expired();

        let candidates: Vec<String> = {
            let locks = self.admission_locks.read().await;
            locks.keys().cloned().collect()
        };

        for session_ref in candidates {
            let active = match self.store.find_active_by_session(&session_ref).await {
                Ok(active) => active,
                Err(e) => {
                    warn!(session = %session_ref, error = %e, "Eviction lookup failed");
                    continue;
                }
            };
            if active.is_some() {
                continue;
            }

            let mut locks = self.admission_locks.write().await;
            if locks
                .get(&session_ref)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                debug!(session = %session_ref, "Evicting idle admission lock");
                locks.remove(&session_ref);
            }
        }
    }

    /// Start the background eviction task.
    ///
    /// Returns a `JoinHandle` that runs until cancelled, evicting idle
    /// bookkeeping every `interval`.
    pub fn start_eviction(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Eviction sweep");
                controller.evict_idle().await;
            }
        })
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.admission_locks.read().await.len()
    }
}
