//! Standalone Layer-3/4 analysis worker (§4.5). Independently deployable from the ingestion
//! and query API process: its own binary, its own Redis connection, its own HTTP client.
//! Shares only the library crate's types (`Job`, `CanonicalEvent`, the OLAP adapter).

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clickhouse::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use wide_trace_api::config::WorkerConfig;
use wide_trace_api::dispatcher::Dispatcher;
use wide_trace_api::event_store::EventStore;
use wide_trace_api::migrations;
use wide_trace_api::models::event::{Attributes, CanonicalEvent, Environment, EventType, Layer, SignalAttrs};
use wide_trace_api::models::job::{Job, JobState, TraceSnapshot};
use wide_trace_api::supervisor::TaskSupervisor;

struct WorkerState {
    event_store: EventStore,
    dispatcher: Dispatcher,
    http_client: reqwest::Client,
    analysis_service_url: String,
    config: WorkerConfig,
    rate_window: Mutex<RateWindow>,
}

struct RateWindow {
    minute_start: Instant,
    sent_this_minute: u32,
}

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    trace_id: Uuid,
    tenant_id: Uuid,
    project_id: Uuid,
    #[serde(flatten)]
    snapshot: &'a TraceSnapshot,
}

#[derive(Debug, Deserialize)]
struct AnalysisResult {
    signal_name: String,
    signal_type: String,
    signal_value: f64,
    signal_severity: wide_trace_api::models::event::Severity,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wide_trace_worker=debug")))
        .init();

    let clickhouse_url = std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_db = std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "wide_events".to_string());
    let clickhouse_user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

    let ch = Client::default()
        .with_url(&clickhouse_url)
        .with_database(&clickhouse_db)
        .with_user(&clickhouse_user)
        .with_password(&clickhouse_password);
    migrations::run(&ch).await?;

    let analysis_service_url = std::env::var("WIDE_ANALYSIS_SERVICE_URL")
        .context("WIDE_ANALYSIS_SERVICE_URL must be set for wide-trace-worker")?;

    let redis_url = std::env::var("WIDE_REDIS_URL").ok();
    let dispatcher = Dispatcher::connect(redis_url.as_deref()).await;
    if !dispatcher.is_connected() {
        tracing::warn!("job queue unavailable at startup; worker will idle until it recovers");
    }

    let config_path = std::env::var("WIDE_CONFIG_FILE").unwrap_or_else(|_| "./wide.toml".to_string());
    let config = wide_trace_api::config::WideConfig::load(&config_path)?;

    let state = Arc::new(WorkerState {
        event_store: EventStore::new(ch),
        dispatcher,
        http_client: reqwest::Client::new(),
        analysis_service_url,
        config: config.worker.clone(),
        rate_window: Mutex::new(RateWindow {
            minute_start: Instant::now(),
            sent_this_minute: 0,
        }),
    });

    let supervisor = Arc::new(TaskSupervisor::new());
    let semaphore = Arc::new(Semaphore::new(state.config.max_concurrency));

    tracing::info!("wide-trace-worker starting, max_concurrency={}", state.config.max_concurrency);

    let mut shutdown = std::pin::pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, draining in-flight jobs");
                break;
            }
            job = state.dispatcher.dequeue(5) => {
                let Some(job) = job else { continue };
                enforce_rate_limit(&state).await;
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let worker_state = state.clone();
                supervisor.spawn(async move {
                    let _permit = permit;
                    process_job(worker_state, job).await;
                });
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Blocks until sending one more job stays within `max_rate_per_minute`, resetting the
/// window every 60 seconds (§4.5 worker step 1, "max rate R jobs/minute").
async fn enforce_rate_limit(state: &WorkerState) {
    loop {
        let mut window = state.rate_window.lock().await;
        if window.minute_start.elapsed() >= Duration::from_secs(60) {
            window.minute_start = Instant::now();
            window.sent_this_minute = 0;
        }
        if window.sent_this_minute < state.config.max_rate_per_minute {
            window.sent_this_minute += 1;
            return;
        }
        let wait = Duration::from_secs(60).saturating_sub(window.minute_start.elapsed());
        drop(window);
        tokio::time::sleep(wait.max(Duration::from_millis(50))).await;
    }
}

/// Runs every requested layer for one job, persisting signals and retrying/dead-lettering
/// on failure (§4.5 "Job processing" / "Retry / failure").
async fn process_job(state: Arc<WorkerState>, mut job: Job) {
    job.state = JobState::Processing;
    let mut signals: Vec<CanonicalEvent> = Vec::new();
    let mut last_error: Option<String> = None;

    for layer in &job.layers {
        let (timeout_secs, path) = match layer {
            Layer::Layer3 => (state.config.layer3_timeout_secs, "layer3"),
            Layer::Layer4 => (state.config.layer4_timeout_secs, "layer4"),
            Layer::Layer2 => continue, // layer2 runs synchronously in the ingestion path, never queued
        };

        match call_analysis_service(&state, &job, *layer, path, timeout_secs).await {
            Ok(mut events) => signals.append(&mut events),
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, layer = layer.as_str(), error = %e, "analysis layer call failed");
                last_error = Some(e);
            }
        }
    }

    if let Some(error) = last_error {
        retry_or_dead_letter(&state, job, error).await;
        return;
    }

    if !signals.is_empty() {
        if let Err(e) = state.event_store.write_events(&signals).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to persist analysis signals");
            retry_or_dead_letter(&state, job, e.to_string()).await;
            return;
        }
    }

    job.state = JobState::Done;
    state.dispatcher.record_done().await;
}

async fn retry_or_dead_letter(state: &WorkerState, job: Job, error: String) {
    if job.attempts + 1 >= state.config.max_retries {
        state.dispatcher.mark_dead(&job, &error).await;
        return;
    }
    let backoff = Duration::from_millis(200 * 2u64.pow(job.attempts.min(5)));
    tokio::time::sleep(backoff).await;
    state.dispatcher.requeue_retry(job).await;
}

async fn call_analysis_service(
    state: &WorkerState,
    job: &Job,
    layer: Layer,
    path: &str,
    timeout_secs: u64,
) -> Result<Vec<CanonicalEvent>, String> {
    let url = format!("{}/analyze/{path}", state.analysis_service_url);
    let request = AnalysisRequest {
        trace_id: job.trace_id,
        tenant_id: job.tenant_id,
        project_id: job.project_id,
        snapshot: &job.trace_data_snapshot,
    };

    let response = state
        .http_client
        .post(&url)
        .json(&request)
        .timeout(Duration::from_secs(timeout_secs))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("analysis service returned {}", response.status()));
    }

    let results: Vec<AnalysisResult> = response.json().await.map_err(|e| e.to_string())?;

    Ok(results
        .into_iter()
        .map(|r| to_signal_event(job, layer, r))
        .collect())
}

fn to_signal_event(job: &Job, layer: Layer, result: AnalysisResult) -> CanonicalEvent {
    CanonicalEvent {
        tenant_id: job.tenant_id,
        project_id: job.project_id,
        environment: Environment::Prod,
        trace_id: job.trace_id,
        span_id: Uuid::new_v4(),
        parent_span_id: None,
        timestamp: Utc::now(),
        event_type: EventType::Error,
        conversation_id: None,
        session_id: None,
        user_id: None,
        agent_name: None,
        version: None,
        route: None,
        attributes: Attributes {
            signal: Some(SignalAttrs {
                signal_name: result.signal_name,
                signal_type: result.signal_type,
                signal_value: result.signal_value,
                signal_severity: result.signal_severity,
                layer,
                metadata: result.metadata,
            }),
            ..Default::default()
        },
        scrubbing_metadata: None,
    }
}
