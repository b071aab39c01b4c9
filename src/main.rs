//! coderun binary
//!
//! Drives one submission through the full pipeline: admission → queue →
//! worker → sandbox, then polls until the execution reaches a terminal
//! state and prints the poll view as JSON.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coderun::admission::AdmissionController;
use coderun::api::{ExecutionService, SubmitResponse};
use coderun::config::Config;
use coderun::queue::ExecutionQueue;
use coderun::ratelimit::{FixedWindowLimiter, SystemClock};
use coderun::sandbox::DockerRunner;
use coderun::session::{InMemorySessions, SessionRecord};
use coderun::store::InMemoryStore;
use coderun::worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "coderun")]
#[command(about = "Run a code snapshot through the sandboxed execution pipeline")]
struct Args {
    /// File with the code to run; reads stdin when omitted
    #[arg(long)]
    file: Option<PathBuf>,

    /// Poll interval while waiting for a terminal state, in milliseconds
    #[arg(long, default_value_t = 250)]
    poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging goes to stderr so stdout carries only the result JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let code = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read code from stdin")?;
            buf
        }
    };

    let store = Arc::new(InMemoryStore::new());
    let sessions = Arc::new(InMemorySessions::new());
    let queue = Arc::new(ExecutionQueue::new());
    let limiter = FixedWindowLimiter::new(
        config.rate_limit.window(),
        config.rate_limit.max_requests,
        Arc::new(SystemClock),
    );

    let session_ref = "local".to_string();
    sessions
        .insert(SessionRecord {
            id: session_ref.clone(),
            language: Some(config.sandbox.language.clone()),
            working_code: code.clone(),
        })
        .await;

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&store) as _,
        Arc::clone(&sessions) as _,
        limiter,
        Arc::clone(&queue),
    ));
    let eviction = admission.start_eviction(config.job.sweep_interval());
    let service = ExecutionService::new(admission, Arc::clone(&store) as _);

    let runner = Arc::new(DockerRunner::new(config.sandbox.clone()));
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store) as _,
        Arc::clone(&queue),
        runner,
        config.job.clone(),
    ));
    let workers = pool.spawn_workers(config.worker_pool_size);
    let sweeper = pool.start_sweeper();

    let execution_id = match service.submit_run(&session_ref, &code).await? {
        SubmitResponse::Accepted { execution_id, .. } => execution_id,
        other => anyhow::bail!("submission rejected: {other:?}"),
    };
    info!(execution = %execution_id, "Submitted, polling for result");

    let view = loop {
        tokio::time::sleep(Duration::from_millis(args.poll_interval_ms)).await;
        let view = service
            .get_execution(&execution_id)
            .await?
            .context("execution record vanished")?;
        if view.status.is_terminal() {
            break view;
        }
    };

    sweeper.abort();
    eviction.abort();
    for worker in workers {
        worker.abort();
    }

    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
