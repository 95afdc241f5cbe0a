use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Derived, one row per `trace_id` (§3 Trace Summary). Lives in the OLTP store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub trace_id: Uuid,
    pub query: Option<String>,
    pub response: Option<String>,
    pub model: Option<String>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_latency_ms: i64,
    pub finish_reason: Option<String>,
    pub has_issues: bool,
    pub malformed: bool,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Optimistic-concurrency column (§4.3, §5, Open Question 3).
    pub version: i64,
}

/// Paging/filter parameters for `listTraces` (§4.8).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceListFilters {
    pub project_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub has_issues: Option<bool>,
    pub model: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceListResponse {
    pub traces: Vec<TraceSummary>,
    pub total: u64,
}

/// Per-node liveness/outcome derived during reconstruction (§4.8 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Success,
    Error,
    Timeout,
}

/// A node in the reconstructed span tree.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub event_type: String,
    pub name: String,
    pub status: SpanStatus,
    pub timestamp: DateTime<Utc>,
    /// Type-specific annotation extracted from the triggering event's attributes (§4.8 step 5).
    pub attributes: Value,
    /// True if `parent_span_id` did not resolve to a fetched node (B4).
    pub orphan: bool,
    pub children: Vec<SpanNode>,
}

/// The fully assembled response for `GET /api/v1/traces/:trace_id`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDetailResponse {
    pub trace_id: Uuid,
    pub roots: Vec<SpanNode>,
    pub span_count: usize,
    pub summary: TraceSummary,
    /// Set when I1 is violated (multiple `trace_end` events) or other inconsistency detected.
    pub malformed: bool,
}
