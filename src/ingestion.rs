//! Ingestion pipeline orchestration (§4.1). Wires auth → rate-limit/quota → parse → validate →
//! tenancy bind → scrub → fan-out (OLAP write, OLTP materialization, Layer-2 signal dispatch)
//! into the single operation the HTTP handler calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::auth::ResolvedCredential;
use crate::config::{IngestionConfig, QuotaConfig, RateLimitConfig, ScrubbingConfig};
use crate::dispatcher::Dispatcher;
use crate::errors::{AppError, EventDiagnostic};
use crate::event_store::EventStore;
use crate::models::event::CanonicalEvent;
use crate::oltp_store::OltpStore;
use crate::supervisor::TaskSupervisor;
use crate::{rate_limit, scrubbing, signal_generator, validation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    JsonArray,
    Ndjson,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    pub accepted_count: usize,
}

/// Bundles the collaborators the pipeline needs without committing to `AppState`'s exact
/// shape — `main.rs`/`lib.rs` construct one of these per request from the shared state.
#[derive(Clone)]
pub struct IngestionDeps {
    pub event_store: Arc<EventStore>,
    pub oltp: Arc<OltpStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingestion_cfg: IngestionConfig,
    pub rate_limit_cfg: RateLimitConfig,
    pub quota_cfg: QuotaConfig,
    pub scrubbing_cfg: ScrubbingConfig,
    pub supervisor: Arc<TaskSupervisor>,
}

/// `ingest(credential, batch)` (§4.1).
pub async fn ingest(
    deps: &IngestionDeps,
    credential: &ResolvedCredential,
    body: &[u8],
    content: ContentKind,
) -> Result<IngestOutcome, AppError> {
    // 2. Rate-limit & quota (auth already resolved by the caller/extractor).
    let raw_values = parse_body(body, content)?;
    rate_limit::check(
        &deps.oltp,
        credential.tenant_id,
        raw_values.len() as u64,
        &deps.rate_limit_cfg,
        &deps.quota_cfg,
    )?;

    // 4. Validate.
    let diagnostics = validation::validate_batch(&raw_values, &deps.ingestion_cfg);
    if !diagnostics.is_empty() {
        return Err(AppError::PayloadInvalid { diagnostics });
    }

    let mut events: Vec<CanonicalEvent> = Vec::with_capacity(raw_values.len());
    for (index, value) in raw_values.into_iter().enumerate() {
        match serde_json::from_value::<CanonicalEvent>(value) {
            Ok(event) => events.push(event),
            Err(e) => {
                return Err(AppError::PayloadInvalid {
                    diagnostics: vec![EventDiagnostic {
                        index,
                        field: "event".to_string(),
                        message: format!("failed to parse canonical event: {e}"),
                    }],
                });
            }
        }
    }

    // 5. Bind tenancy (whole-batch reject, P4).
    for event in &events {
        if event.tenant_id != credential.tenant_id || event.project_id != credential.project_id {
            return Err(AppError::Forbidden);
        }
    }

    // 6. Scrub.
    for event in &mut events {
        scrubbing::scrub_event(event, &deps.scrubbing_cfg);
    }

    // 7a. OLAP write.
    let write_outcome = deps.event_store.write_events(&events).await?;
    if !write_outcome.quarantined.is_empty() {
        tracing::warn!(
            quarantined = write_outcome.quarantined.len(),
            "some events quarantined by the event store"
        );
    }

    // 7b. Trace-summary materialization, grouped by trace_id.
    let mut by_trace: HashMap<Uuid, Vec<CanonicalEvent>> = HashMap::new();
    for event in &events {
        by_trace.entry(event.trace_id).or_default().push(event.clone());
    }
    for (trace_id, trace_events) in by_trace {
        deps.oltp
            .upsert_trace_summary(credential.tenant_id, credential.project_id, trace_id, &trace_events)?;
    }

    // 7c. Signal generation — never fails the request, but the task is supervised rather
    // than detached so it is still reachable at shutdown (§5 fire-and-forget redesign).
    let signal_deps = deps.clone();
    let signal_batch = events.clone();
    deps.supervisor.spawn(async move {
        if let Err(e) = signal_generator::generate_and_persist(&signal_deps, signal_batch).await {
            tracing::warn!(error = %e, "layer-2 signal generation failed");
        }
    });

    Ok(IngestOutcome {
        accepted_count: write_outcome.accepted,
    })
}

fn parse_body(body: &[u8], content: ContentKind) -> Result<Vec<Value>, AppError> {
    let text = std::str::from_utf8(body).map_err(|_| AppError::PayloadInvalid {
        diagnostics: vec![EventDiagnostic {
            index: 0,
            field: "body".to_string(),
            message: "body is not valid UTF-8".to_string(),
        }],
    })?;

    match content {
        ContentKind::JsonArray => serde_json::from_str::<Vec<Value>>(text).map_err(|e| AppError::PayloadInvalid {
            diagnostics: vec![EventDiagnostic {
                index: 0,
                field: "body".to_string(),
                message: format!("body is not a JSON array: {e}"),
            }],
        }),
        ContentKind::Ndjson => {
            let mut values = Vec::new();
            for (index, line) in text.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value = serde_json::from_str::<Value>(trimmed).map_err(|e| AppError::PayloadInvalid {
                    diagnostics: vec![EventDiagnostic {
                        index,
                        field: "body".to_string(),
                        message: format!("invalid NDJSON line: {e}"),
                    }],
                })?;
                values.push(value);
            }
            Ok(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let body = br#"[{"a":1},{"b":2}]"#;
        let values = parse_body(body, ContentKind::JsonArray).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn parses_ndjson_skipping_blank_lines() {
        let body = b"{\"a\":1}\n\n{\"b\":2}\n";
        let values = parse_body(body, ContentKind::Ndjson).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn rejects_malformed_ndjson_line() {
        let body = b"{\"a\":1}\nnot json\n";
        let result = parse_body(body, ContentKind::Ndjson);
        assert!(result.is_err());
    }
}
