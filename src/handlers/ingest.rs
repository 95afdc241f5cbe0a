use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;

use crate::AppState;
use crate::auth;
use crate::errors::AppError;
use crate::ingestion::{self, ContentKind, IngestOutcome};

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthenticated)?;
    raw.strip_prefix("Bearer ").ok_or(AppError::Unauthenticated)
}

fn content_kind(headers: &HeaderMap) -> ContentKind {
    match headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) if ct.contains("ndjson") => ContentKind::Ndjson,
        _ => ContentKind::JsonArray,
    }
}

/// `POST /api/v1/events/ingest` (§6).
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<IngestOutcome>, AppError> {
    let token = bearer_token(&headers)?;
    let credential = auth::resolve_credential(token, &state.credential_secret, &state.oltp).await?;
    let deps = state.ingestion_deps();
    let outcome = ingestion::ingest(&deps, &credential, &body, content_kind(&headers)).await?;
    Ok(Json(outcome))
}
