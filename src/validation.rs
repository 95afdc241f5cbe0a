//! Schema validation (§4.1 step 4): structural + UUIDv4 + ISO-8601 + event-type discriminator,
//! plus the batch/event size limits from §6 and B1/B2.

use serde_json::Value;
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::errors::EventDiagnostic;

const KNOWN_EVENT_TYPES: &[&str] = &[
    "trace_start",
    "trace_end",
    "llm_call",
    "tool_call",
    "retrieval",
    "embedding",
    "vector_db_operation",
    "cache_operation",
    "agent_create",
    "error",
    "output",
    "feedback",
];

/// Event types that carry no required typed payload (pure lifecycle markers).
const PAYLOAD_OPTIONAL_TYPES: &[&str] = &["trace_start", "trace_end"];

/// Validates the whole batch, returning every diagnostic found. An empty vec means the batch
/// may proceed. Per §4.1 step 4, the caller rejects the *entire* batch if this is non-empty.
pub fn validate_batch(events: &[Value], cfg: &IngestionConfig) -> Vec<EventDiagnostic> {
    let mut diagnostics = Vec::new();

    if events.len() > cfg.max_batch_size {
        diagnostics.push(EventDiagnostic {
            index: 0,
            field: "batch".to_string(),
            message: format!(
                "batch contains {} events, exceeding the limit of {}",
                events.len(),
                cfg.max_batch_size
            ),
        });
        return diagnostics;
    }

    for (index, event) in events.iter().enumerate() {
        diagnostics.extend(validate_event(index, event, cfg));
    }
    diagnostics
}

fn validate_event(index: usize, value: &Value, cfg: &IngestionConfig) -> Vec<EventDiagnostic> {
    let mut diagnostics = Vec::new();
    let diag = |field: &str, message: String| EventDiagnostic {
        index,
        field: field.to_string(),
        message,
    };

    let approx_size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(usize::MAX);
    if approx_size > cfg.max_event_bytes {
        diagnostics.push(diag(
            "event",
            format!("event is {approx_size} bytes, exceeding the limit of {}", cfg.max_event_bytes),
        ));
    }

    let Some(obj) = value.as_object() else {
        diagnostics.push(diag("event", "event must be a JSON object".to_string()));
        return diagnostics;
    };

    for field in ["tenant_id", "project_id", "trace_id", "span_id", "timestamp", "event_type"] {
        if !obj.contains_key(field) {
            diagnostics.push(diag(field, format!("missing required field `{field}`")));
        }
    }

    for field in ["tenant_id", "project_id", "trace_id", "span_id"] {
        if let Some(v) = obj.get(field) {
            validate_uuid_v4(v, field, &diag, &mut diagnostics);
        }
    }

    if let Some(parent) = obj.get("parent_span_id") {
        if !parent.is_null() {
            validate_uuid_v4(parent, "parent_span_id", &diag, &mut diagnostics);
        }
    }

    if let Some(ts) = obj.get("timestamp") {
        match ts.as_str() {
            Some(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {}
            _ => diagnostics.push(diag("timestamp", "timestamp must be ISO-8601".to_string())),
        }
    }

    let event_type = obj.get("event_type").and_then(Value::as_str);
    match event_type {
        None => {}
        Some(et) if !KNOWN_EVENT_TYPES.contains(&et) => {
            diagnostics.push(diag("event_type", format!("unknown event_type `{et}`")));
        }
        Some(et) if !PAYLOAD_OPTIONAL_TYPES.contains(&et) => {
            let has_payload = obj
                .get("attributes")
                .and_then(Value::as_object)
                .map(|a| a.get(et).is_some_and(|p| !p.is_null()))
                .unwrap_or(false);
            if !has_payload {
                diagnostics.push(diag(
                    "attributes",
                    format!("event_type `{et}` requires a matching `attributes.{et}` payload"),
                ));
            }
        }
        Some(_) => {}
    }

    diagnostics
}

fn validate_uuid_v4(
    value: &Value,
    field: &str,
    diag: &dyn Fn(&str, String) -> EventDiagnostic,
    out: &mut Vec<EventDiagnostic>,
) {
    match value.as_str() {
        Some(s) => match Uuid::parse_str(s) {
            Ok(u) if u.get_version_num() == 4 => {}
            Ok(_) => out.push(diag(field, format!("`{field}` must be a UUIDv4"))),
            Err(_) => out.push(diag(field, format!("`{field}` is not a valid UUID"))),
        },
        None => out.push(diag(field, format!("`{field}` must be a string"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> IngestionConfig {
        IngestionConfig {
            max_batch_size: 1000,
            max_event_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn rejects_batch_over_limit() {
        let events = vec![json!({}); 1001];
        let diagnostics = validate_batch(&events, &cfg());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].field, "batch");
    }

    #[test]
    fn accepts_well_formed_trace_start() {
        let event = json!({
            "tenant_id": Uuid::new_v4().to_string(),
            "project_id": Uuid::new_v4().to_string(),
            "environment": "prod",
            "trace_id": Uuid::new_v4().to_string(),
            "span_id": Uuid::new_v4().to_string(),
            "parent_span_id": null,
            "timestamp": "2026-01-01T12:00:00Z",
            "event_type": "trace_start",
        });
        let diagnostics = validate_batch(&[event], &cfg());
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
    }

    #[test]
    fn rejects_llm_call_missing_payload() {
        let event = json!({
            "tenant_id": Uuid::new_v4().to_string(),
            "project_id": Uuid::new_v4().to_string(),
            "trace_id": Uuid::new_v4().to_string(),
            "span_id": Uuid::new_v4().to_string(),
            "timestamp": "2026-01-01T12:00:00Z",
            "event_type": "llm_call",
        });
        let diagnostics = validate_batch(&[event], &cfg());
        assert!(diagnostics.iter().any(|d| d.field == "attributes"));
    }

    #[test]
    fn rejects_non_uuidv4_trace_id() {
        let event = json!({
            "tenant_id": Uuid::new_v4().to_string(),
            "project_id": Uuid::new_v4().to_string(),
            "trace_id": "not-a-uuid",
            "span_id": Uuid::new_v4().to_string(),
            "timestamp": "2026-01-01T12:00:00Z",
            "event_type": "trace_start",
        });
        let diagnostics = validate_batch(&[event], &cfg());
        assert!(diagnostics.iter().any(|d| d.field == "trace_id"));
    }
}
