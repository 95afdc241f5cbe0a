//! Event store adapter (OLAP, §4.2). Serializes canonical events into the columnar row
//! format, batch-ships them, and retries with jittered exponential backoff.

use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::migrations::DATABASE;
use crate::models::event::CanonicalEvent;

const MAX_RETRIES: u32 = 4;
const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2_000;

/// The flat row shape `canonical_events` actually stores. Nullable context columns are
/// normalized to empty strings because ClickHouse's `String` type rejects NULL under the
/// strict non-Nullable schema used here (§4.2 contract).
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct CanonicalEventRow {
    pub tenant_id: String,
    pub project_id: String,
    pub environment: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub conversation_id: String,
    pub session_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub version: String,
    pub route: String,
    pub attributes_json: String,
}

pub fn to_row(event: &CanonicalEvent) -> CanonicalEventRow {
    CanonicalEventRow {
        tenant_id: event.tenant_id.to_string(),
        project_id: event.project_id.to_string(),
        environment: format!("{:?}", event.environment).to_lowercase(),
        trace_id: event.trace_id.to_string(),
        span_id: event.span_id.to_string(),
        parent_span_id: event.parent_span_id.map(|u| u.to_string()).unwrap_or_default(),
        timestamp: event.timestamp,
        event_type: event.event_type.as_str().to_string(),
        conversation_id: event.conversation_id.clone().unwrap_or_default(),
        session_id: event.session_id.clone().unwrap_or_default(),
        user_id: event.user_id.clone().unwrap_or_default(),
        agent_name: event.agent_name.clone().unwrap_or_default(),
        version: event.version.clone().unwrap_or_default(),
        route: event.route.clone().unwrap_or_default(),
        attributes_json: serde_json::to_string(&event.attributes).unwrap_or_else(|_| "{}".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct QuarantinedEvent {
    pub span_id: Uuid,
    pub event_type: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub accepted: usize,
    pub quarantined: Vec<QuarantinedEvent>,
}

/// Explicit collaborator wrapping the ClickHouse client (§9 "shared global clients" — modeled
/// as a constructor-injected value on `AppState`, not a module-level singleton).
#[derive(Clone)]
pub struct EventStore {
    client: Client,
}

impl EventStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// `writeEvents(events[]) -> {accepted, quarantined[]}` (§4.2).
    pub async fn write_events(&self, events: &[CanonicalEvent]) -> Result<WriteOutcome, AppError> {
        if events.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let rows: Vec<CanonicalEventRow> = events.iter().map(to_row).collect();

        let mut attempt = 0;
        loop {
            match self.insert_batch(&rows).await {
                Ok(()) => {
                    return Ok(WriteOutcome {
                        accepted: rows.len(),
                        quarantined: Vec::new(),
                    });
                }
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff = jittered_backoff(attempt);
                    tracing::warn!(attempt, error = %err, backoff_ms = backoff, "OLAP write failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "OLAP write exhausted retry budget");
                    return Err(AppError::DownstreamUnavailable(format!("event store: {err}")));
                }
            }
        }
    }

    async fn insert_batch(&self, rows: &[CanonicalEventRow]) -> Result<(), clickhouse::error::Error> {
        let mut insert = self.client.insert(&format!("{DATABASE}.canonical_events"))?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }

    /// Fetches every event for a trace, ordered by timestamp, for reconstruction (§4.8 step 1).
    pub async fn fetch_trace_events(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<CanonicalEventRow>, AppError> {
        let sql = format!(
            "SELECT * FROM {DATABASE}.canonical_events WHERE tenant_id = ? AND trace_id = ? ORDER BY timestamp ASC"
        );
        self.client
            .query(&sql)
            .bind(tenant_id.to_string())
            .bind(trace_id.to_string())
            .fetch_all::<CanonicalEventRow>()
            .await
            .map_err(|e| AppError::DownstreamUnavailable(format!("event store: {e}")))
    }
}

fn jittered_backoff(attempt: u32) -> u64 {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(8)).min(MAX_BACKOFF_MS);
    let jitter = rand::rng().random_range(0..=exp / 4 + 1);
    (exp - exp / 8 + jitter).min(MAX_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{Attributes, EventType, Environment, LlmCallAttrs};

    fn sample() -> CanonicalEvent {
        CanonicalEvent {
            tenant_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            environment: Environment::Prod,
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            timestamp: Utc::now(),
            event_type: EventType::LlmCall,
            conversation_id: None,
            session_id: None,
            user_id: Some("u1".to_string()),
            agent_name: None,
            version: None,
            route: None,
            attributes: Attributes {
                llm_call: Some(LlmCallAttrs {
                    model: Some("gpt-4".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            scrubbing_metadata: None,
        }
    }

    #[test]
    fn to_row_normalizes_missing_context_to_empty_strings() {
        let row = to_row(&sample());
        assert_eq!(row.conversation_id, "");
        assert_eq!(row.session_id, "");
        assert_eq!(row.user_id, "u1");
        assert_eq!(row.parent_span_id, "");
        assert!(row.attributes_json.contains("gpt-4"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b1 = jittered_backoff(1);
        let b8 = jittered_backoff(8);
        assert!(b1 <= MAX_BACKOFF_MS);
        assert!(b8 <= MAX_BACKOFF_MS);
    }
}
