use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::event::{Layer, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl JobPriority {
    /// Matches the `{tenant}:analysis:{priority}` queue key layout (§6).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    HighSeverity,
    ExplicitRequest,
    Sampling,
}

/// `queued → claimed → processing → (done | failed_retryable | dead)` (§4.5 "State machine").
/// Terminal states are `Done`/`Dead`; `FailedRetryable` always loops back to `Queued` via
/// `Dispatcher::requeue_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Claimed,
    Processing,
    Done,
    FailedRetryable,
    Dead,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Queued
    }
}

/// Dispatcher payload (§3 Job). Ephemeral — only its resulting signals outlive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub trace_id: Uuid,
    pub layers: Vec<Layer>,
    pub trace_data_snapshot: TraceSnapshot,
    pub trigger: JobTrigger,
    pub priority: JobPriority,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub state: JobState,
}

/// The minimal slice of trace context the analysis service needs, carried with the job
/// so the worker does not have to re-fetch the whole trace from the OLAP store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSnapshot {
    pub query: Option<String>,
    pub response: Option<String>,
    pub retrieved_contexts: Vec<String>,
    pub tool_outputs: Vec<serde_json::Value>,
    pub triggering_signal: Option<String>,
    pub triggering_severity: Option<Severity>,
}

/// Result of a `queue*` call, degrading gracefully when the queue backend is unreachable (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { job_id: Uuid },
    NotQueued { reason: String },
}

/// Worker-observable queue/health counters (`GET /api/v1/analysis/queue/stats`, §6).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub done: u64,
    pub failed: u64,
    pub queue_available: bool,
}
