//! `/health` and `/health/detailed` (§6). The first is a liveness probe only; the second
//! performs a bounded-timeout round trip to every configured dependency.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

const DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(2);

/// Lightweight liveness check: the process is up and serving.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, serde::Serialize)]
struct DependencyStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn ok() -> DependencyStatus {
    DependencyStatus { status: "ok", detail: None }
}

fn down(detail: impl Into<String>) -> DependencyStatus {
    DependencyStatus {
        status: "down",
        detail: Some(detail.into()),
    }
}

fn skipped(detail: impl Into<String>) -> DependencyStatus {
    DependencyStatus {
        status: "not_configured",
        detail: Some(detail.into()),
    }
}

/// Bounded-timeout round trip to OLAP, OLTP, the job queue, and (if configured) the
/// analysis service. Reports per-dependency status plus an overall `ok`/`degraded` verdict.
pub async fn healthz_detailed(State(state): State<AppState>) -> Json<Value> {
    let olap = match tokio::time::timeout(DEPENDENCY_TIMEOUT, state.ch.query("SELECT 1").execute()).await {
        Ok(Ok(())) => ok(),
        Ok(Err(e)) => down(e.to_string()),
        Err(_) => down("timed out"),
    };

    let oltp = {
        let store = state.oltp.clone();
        let probe = tokio::task::spawn_blocking(move || store.get_trace_summary(uuid::Uuid::nil(), uuid::Uuid::nil()));
        match tokio::time::timeout(DEPENDENCY_TIMEOUT, probe).await {
            Ok(Ok(Ok(_))) => ok(),
            Ok(Ok(Err(e))) => down(e.to_string()),
            Ok(Err(e)) => down(e.to_string()),
            Err(_) => down("timed out"),
        }
    };

    let queue = if state.dispatcher.is_connected() {
        match tokio::time::timeout(DEPENDENCY_TIMEOUT, state.dispatcher.stats()).await {
            Ok(stats) if stats.queue_available => ok(),
            Ok(_) => down("queue backend reported unavailable"),
            Err(_) => down("timed out"),
        }
    } else {
        skipped("WIDE_REDIS_URL not set")
    };

    let analysis_service = match state.analysis_service_url.as_deref() {
        None => skipped("WIDE_ANALYSIS_SERVICE_URL not set"),
        Some(url) => {
            let request = state.http_client.get(format!("{url}/health")).timeout(DEPENDENCY_TIMEOUT).send();
            match tokio::time::timeout(DEPENDENCY_TIMEOUT, request).await {
                Ok(Ok(resp)) if resp.status().is_success() => ok(),
                Ok(Ok(resp)) => down(format!("status {}", resp.status())),
                Ok(Err(e)) => down(e.to_string()),
                Err(_) => down("timed out"),
            }
        }
    };

    let degraded = [&olap, &oltp, &queue, &analysis_service]
        .iter()
        .any(|d| d.status == "down");

    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "dependencies": {
            "olap": olap,
            "oltp": oltp,
            "queue": queue,
            "analysis_service": analysis_service,
        }
    }))
}
