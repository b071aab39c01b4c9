//! Worker pool and retry/failure supervision.
//!
//! Workers pull execution ids from the queue, drive the record through
//! `RUNNING` and invoke the sandbox runner. Retries are a job-level
//! concept: only attempts that failed before user code ran (spawn
//! failures, job-ceiling expiry) are retried. Any outcome from code that
//! actually executed — success, runtime failure, sandbox timeout — is
//! terminal, so user code is never re-run with side effects duplicated.
//!
//! A background sweeper finalizes `RUNNING` records abandoned past the
//! job ceiling, so no execution is ever stuck non-terminal.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobConfig;
use crate::queue::ExecutionQueue;
use crate::sandbox::{SandboxOutcome, SandboxRunner};
use crate::store::{ExecutionStatus, ExecutionStore, UpdateFields};

/// Pool of workers consuming the execution queue, plus the supervision
/// policy applied to each job.
pub struct WorkerPool {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<ExecutionQueue>,
    runner: Arc<dyn SandboxRunner>,
    job: JobConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: Arc<ExecutionQueue>,
        runner: Arc<dyn SandboxRunner>,
        job: JobConfig,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            job,
        }
    }

    /// Spawn `pool_size` workers. Each runs until the queue is closed and
    /// drained. Pool size bounds concurrent sandbox containers.
    pub fn spawn_workers(self: &Arc<Self>, pool_size: usize) -> Vec<JoinHandle<()>> {
        (0..pool_size)
            .map(|worker| {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    debug!(worker, "Worker started");
                    while let Some(execution_id) = pool.queue.dequeue().await {
                        pool.process(&execution_id).await;
                    }
                    debug!(worker, "Worker stopped: queue closed");
                })
            })
            .collect()
    }

    /// Handle one dequeued job end to end.
    pub async fn process(&self, execution_id: &str) {
        // Re-read current state; the queue payload is just an id.
        let execution = match self.store.get(execution_id).await {
            Ok(execution) => execution,
            Err(e) => {
                // Inconsistent queue entry. Log and drop, no state mutation.
                warn!(execution = %execution_id, error = %e, "Dropping job for unknown execution");
                return;
            }
        };

        if execution.status.is_terminal() {
            debug!(execution = %execution_id, status = %execution.status, "Skipping redelivered terminal job");
            return;
        }

        // Fail fast: no attempt consumed, runner never invoked.
        if !self.runner.supports(&execution.language) {
            info!(execution = %execution_id, language = %execution.language, "Unsupported language");
            if self.mark_running(execution_id).await {
                self.finalize(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("Unsupported language: {}", execution.language)),
                    None,
                )
                .await;
            }
            return;
        }

        let mut last_failure = String::new();
        for attempt in 1..=self.job.max_attempts {
            if !self.mark_running(execution_id).await {
                return;
            }
            debug!(execution = %execution_id, attempt, "Attempt started");

            let run = self
                .runner
                .run(&execution.code_snapshot, &execution.language);
            let outcome = match tokio::time::timeout(self.job.timeout(), run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Dropping the run future kills the container via
                    // kill_on_drop; the attempt is abandoned and retried.
                    warn!(execution = %execution_id, attempt, "Attempt exceeded the job ceiling");
                    last_failure = format!(
                        "attempt exceeded the {}s job ceiling",
                        self.job.timeout_seconds
                    );
                    continue;
                }
            };

            match outcome {
                SandboxOutcome::Success {
                    stdout,
                    stderr,
                    elapsed_ms,
                } => {
                    self.finalize(
                        execution_id,
                        ExecutionStatus::Completed,
                        Some(stdout),
                        Some(stderr),
                        Some(elapsed_ms),
                    )
                    .await;
                    return;
                }
                SandboxOutcome::RuntimeFailure { stderr, elapsed_ms } => {
                    self.finalize(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(stderr),
                        Some(elapsed_ms),
                    )
                    .await;
                    return;
                }
                SandboxOutcome::Timeout {
                    partial_stderr,
                    elapsed_ms,
                } => {
                    // The code already ran for the full ceiling; retrying
                    // would execute it again. Terminal.
                    self.finalize(
                        execution_id,
                        ExecutionStatus::Timeout,
                        None,
                        Some(partial_stderr),
                        Some(elapsed_ms),
                    )
                    .await;
                    return;
                }
                SandboxOutcome::InfrastructureFailure { message } => {
                    warn!(execution = %execution_id, attempt, error = %message, "Sandbox infrastructure failure");
                    last_failure = message;
                }
                SandboxOutcome::UnsupportedLanguage { language } => {
                    // Defensive: `supports` was checked above.
                    self.finalize(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(format!("Unsupported language: {language}")),
                        None,
                    )
                    .await;
                    return;
                }
            }
        }

        error!(execution = %execution_id, attempts = self.job.max_attempts, "Retries exhausted");
        self.finalize(
            execution_id,
            ExecutionStatus::Failed,
            None,
            Some(format!(
                "Job failed after {} attempts: {last_failure}",
                self.job.max_attempts
            )),
            None,
        )
        .await;
    }

    /// Enter `RUNNING` for a fresh attempt. Returns false when the record
    /// can no longer be updated (e.g. the sweeper finalized it first).
    async fn mark_running(&self, execution_id: &str) -> bool {
        match self
            .store
            .update_fields(execution_id, UpdateFields::running(Utc::now()))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(execution = %execution_id, error = %e, "Cannot enter RUNNING, abandoning job");
                false
            }
        }
    }

    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        stdout: Option<String>,
        stderr: Option<String>,
        execution_time_ms: Option<u64>,
    ) {
        let update = UpdateFields::terminal(status, stdout, stderr, execution_time_ms, Utc::now());
        match self.store.update_fields(execution_id, update).await {
            Ok(_) => {
                info!(execution = %execution_id, status = %status, "Execution finalized");
            }
            Err(e) => {
                // Lost the race against the sweeper; the record is already
                // terminal and immutable.
                warn!(execution = %execution_id, error = %e, "Failed to finalize execution");
            }
        }
    }

    /// Finalize `RUNNING` records whose attempt started before the
    /// staleness cutoff. Liveness guarantee for executions whose worker
    /// died mid-attempt.
    pub async fn sweep_stale(&self) {
        let stale_secs = i64::try_from(self.job.stale_after_seconds).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::seconds(stale_secs);

        let stale = match self.store.find_stale_running(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Recovery sweep query failed");
                return;
            }
        };

        for record in stale {
            warn!(execution = %record.id, session = %record.session_ref, "Finalizing stale RUNNING execution");
            self.finalize(
                &record.id,
                ExecutionStatus::Failed,
                None,
                Some("Execution abandoned: worker exceeded the job ceiling".to_string()),
                None,
            )
            .await;
        }
    }

    /// Start the background recovery sweeper.
    ///
    /// Returns a `JoinHandle` that runs until cancelled, sweeping every
    /// `sweep_interval`.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = pool.job.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Recovery sweep");
                pool.sweep_stale().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, NewExecution};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Runner fed a script of outcomes, one per `run` call.
    struct ScriptedRunner {
        outcomes: Mutex<VecDeque<SandboxOutcome>>,
        run_calls: AtomicUsize,
        supported: bool,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<SandboxOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                run_calls: AtomicUsize::new(0),
                supported: true,
            }
        }

        fn unsupported() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                run_calls: AtomicUsize::new(0),
                supported: false,
            }
        }

        fn calls(&self) -> usize {
            self.run_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SandboxRunner for ScriptedRunner {
        fn supports(&self, _language: &str) -> bool {
            self.supported
        }

        async fn run(&self, _code: &str, _language: &str) -> SandboxOutcome {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SandboxOutcome::InfrastructureFailure {
                    message: "script exhausted".to_string(),
                })
        }
    }

    /// Runner that never finishes within the job ceiling.
    struct HungRunner;

    #[async_trait]
    impl SandboxRunner for HungRunner {
        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn run(&self, _code: &str, _language: &str) -> SandboxOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            SandboxOutcome::InfrastructureFailure {
                message: "unreachable".to_string(),
            }
        }
    }

    fn success(stdout: &str) -> SandboxOutcome {
        SandboxOutcome::Success {
            stdout: stdout.to_string(),
            stderr: String::new(),
            elapsed_ms: 42,
        }
    }

    fn infra(message: &str) -> SandboxOutcome {
        SandboxOutcome::InfrastructureFailure {
            message: message.to_string(),
        }
    }

    async fn pool_with_runner(
        runner: Arc<dyn SandboxRunner>,
        job: JobConfig,
    ) -> (Arc<WorkerPool>, Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(ExecutionQueue::new());
        let execution = store
            .create(NewExecution {
                session_ref: "s1".to_string(),
                code_snapshot: "print(1)".to_string(),
                language: "python".to_string(),
            })
            .await
            .unwrap();
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store) as _,
            queue,
            runner,
            job,
        ));
        (pool, store, execution.id)
    }

    #[tokio::test]
    async fn success_maps_to_completed() {
        let runner = Arc::new(ScriptedRunner::new(vec![success("Hello World\n")]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.stdout.as_deref(), Some("Hello World\n"));
        assert_eq!(record.stderr.as_deref(), Some(""));
        assert_eq!(record.execution_time_ms, Some(42));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn runtime_failure_maps_to_failed_without_retry() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            SandboxOutcome::RuntimeFailure {
                stderr: "NameError: name 'x' is not defined".to_string(),
                elapsed_ms: 17,
            },
        ]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.stderr.unwrap().contains("NameError"));
        assert_eq!(record.execution_time_ms, Some(17));
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn sandbox_timeout_is_terminal_and_not_retried() {
        let runner = Arc::new(ScriptedRunner::new(vec![SandboxOutcome::Timeout {
            partial_stderr: "Execution timed out after 10 seconds.\n".to_string(),
            elapsed_ms: 10_042,
        }]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert!(record.execution_time_ms.unwrap() >= 10_000);
        // Code that already ran to the ceiling is never re-executed
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn infrastructure_failures_are_retried() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            infra("engine unavailable"),
            infra("engine unavailable"),
            success("ok\n"),
        ]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.stdout.as_deref(), Some("ok\n"));
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_finalize_failed() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            infra("no engine"),
            infra("no engine"),
            infra("no engine"),
        ]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        let stderr = record.stderr.unwrap();
        assert!(stderr.contains("after 3 attempts"));
        assert!(stderr.contains("no engine"));
        assert!(record.finished_at.is_some());
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn unsupported_language_fails_fast_without_invoking_runner() {
        let runner = Arc::new(ScriptedRunner::unsupported());
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.stderr.unwrap().contains("Unsupported language"));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn job_ceiling_abandons_hung_attempts() {
        let job = JobConfig {
            max_attempts: 2,
            timeout_seconds: 1,
            ..JobConfig::default()
        };
        let (pool, store, id) = pool_with_runner(Arc::new(HungRunner), job).await;

        pool.process(&id).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.stderr.unwrap().contains("job ceiling"));
    }

    #[tokio::test]
    async fn unknown_execution_id_is_dropped_without_mutation() {
        let runner = Arc::new(ScriptedRunner::new(vec![success("x")]));
        let (pool, _store, _id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process("no-such-id").await;
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_skipped() {
        let runner = Arc::new(ScriptedRunner::new(vec![success("once\n")]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        pool.process(&id).await;
        pool.process(&id).await; // at-least-once redelivery

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn sweep_finalizes_stale_running_records() {
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        // Simulate a worker that died mid-attempt long ago
        let long_ago = Utc::now() - chrono::Duration::seconds(600);
        store
            .update_fields(&id, UpdateFields::running(long_ago))
            .await
            .unwrap();

        pool.sweep_stale().await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.stderr.unwrap().contains("abandoned"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_running_records_alone() {
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let (pool, store, id) =
            pool_with_runner(Arc::clone(&runner) as _, JobConfig::default()).await;

        store
            .update_fields(&id, UpdateFields::running(Utc::now()))
            .await
            .unwrap();

        pool.sweep_stale().await;
        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(ExecutionQueue::new());
        let runner = Arc::new(ScriptedRunner::new(vec![
            success("a"),
            success("b"),
            success("c"),
        ]));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store) as _,
            Arc::clone(&queue),
            Arc::clone(&runner) as _,
            JobConfig::default(),
        ));

        let mut ids = Vec::new();
        for session in ["s1", "s2", "s3"] {
            let execution = store
                .create(NewExecution {
                    session_ref: session.to_string(),
                    code_snapshot: "print(1)".to_string(),
                    language: "python".to_string(),
                })
                .await
                .unwrap();
            queue.enqueue(&execution.id).unwrap();
            ids.push(execution.id);
        }

        let handles = pool.spawn_workers(2);

        // Poll until all three are terminal
        for _ in 0..100 {
            let mut done = 0;
            for id in &ids {
                if store.get(id).await.unwrap().status.is_terminal() {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for id in &ids {
            assert_eq!(
                store.get(id).await.unwrap().status,
                ExecutionStatus::Completed
            );
        }
        for handle in handles {
            handle.abort();
        }
    }
}
