use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::auth;
use crate::errors::AppError;
use crate::models::job::{EnqueueOutcome, QueueStats, TraceSnapshot};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub trace_id: Uuid,
}

#[derive(Debug, serde::Serialize)]
pub struct AnalyzeResponse {
    pub trace_id: Uuid,
    #[serde(flatten)]
    pub outcome: EnqueueOutcomeWire,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcomeWire {
    Queued { job_id: Uuid },
    NotQueued { reason: String },
}

impl From<EnqueueOutcome> for EnqueueOutcomeWire {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Queued { job_id } => EnqueueOutcomeWire::Queued { job_id },
            EnqueueOutcome::NotQueued { reason } => EnqueueOutcomeWire::NotQueued { reason },
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthenticated)?;
    raw.strip_prefix("Bearer ").ok_or(AppError::Unauthenticated)
}

/// `POST /api/v1/analysis/analyze` (§6, §4.5 `queueForExplicitRequest`).
pub async fn analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let token = bearer_token(&headers)?;
    let credential = auth::resolve_credential(token, &state.credential_secret, &state.oltp).await?;

    let rows = state
        .event_store
        .fetch_trace_events(credential.tenant_id, request.trace_id)
        .await?;
    if rows.is_empty() {
        return Err(AppError::NotFound);
    }

    let snapshot = build_snapshot(&rows);

    let outcome = state
        .dispatcher
        .queue_for_explicit_request(request.trace_id, credential.tenant_id, credential.project_id, snapshot)
        .await;

    Ok(Json(AnalyzeResponse {
        trace_id: request.trace_id,
        outcome: outcome.into(),
    }))
}

fn build_snapshot(rows: &[crate::event_store::CanonicalEventRow]) -> TraceSnapshot {
    let mut query = None;
    let mut response = None;
    let mut retrieved_contexts = Vec::new();
    let mut tool_outputs = Vec::new();

    for row in rows {
        let attrs: crate::models::event::Attributes =
            serde_json::from_str(&row.attributes_json).unwrap_or_default();
        if let Some(llm) = attrs.llm_call {
            if query.is_none() {
                query = llm.input;
            }
            response = llm.output.or(response);
        }
        if let Some(retrieval) = attrs.retrieval {
            if let Some(ids) = retrieval.context_ids {
                retrieved_contexts.extend(ids);
            }
        }
        if let Some(tool) = attrs.tool_call {
            if let Some(result) = tool.result {
                tool_outputs.push(result);
            }
        }
    }

    TraceSnapshot {
        query,
        response,
        retrieved_contexts,
        tool_outputs,
        triggering_signal: None,
        triggering_severity: None,
    }
}

/// `GET /api/v1/analysis/queue/stats` (§6).
pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.dispatcher.stats().await)
}
