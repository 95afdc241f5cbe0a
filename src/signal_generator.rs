//! Layer-2 signal generator (§4.4). Purely deterministic rules evaluated inline against a
//! freshly ingested batch; never calls out to anything heavier than the event store itself.
//! Runs detached from the request (see `ingestion::ingest` step 7c) but is itself just a
//! plain async function — the detachment, and its observability, live at the call site.

use chrono::Utc;

use crate::errors::AppError;
use crate::ingestion::IngestionDeps;
use crate::models::event::{
    Attributes, CanonicalEvent, EventType, Layer, ResultStatus, Severity, SignalAttrs,
};
use crate::models::job::TraceSnapshot;

/// One deterministic rule match, prior to being turned into a signal event.
struct Matched {
    signal_name: &'static str,
    signal_type: &'static str,
    signal_value: f64,
    severity: Severity,
    metadata: serde_json::Value,
}

/// Evaluates every rule in the §4.4 table against one event, returning every match (an event
/// can trip more than one rule, e.g. an `llm_call` that is both slow and expensive).
fn evaluate_rules(event: &CanonicalEvent) -> Vec<Matched> {
    let mut matches = Vec::new();

    if let Some(llm) = event.attributes.llm_call.as_ref() {
        if let Some(latency) = llm.latency_ms {
            if latency > 5000.0 {
                matches.push(Matched {
                    signal_name: "high_latency",
                    signal_type: "latency",
                    signal_value: latency,
                    severity: Severity::High,
                    metadata: serde_json::json!({"latency_ms": latency}),
                });
            } else if latency > 2000.0 {
                matches.push(Matched {
                    signal_name: "elevated_latency",
                    signal_type: "latency",
                    signal_value: latency,
                    severity: Severity::Medium,
                    metadata: serde_json::json!({"latency_ms": latency}),
                });
            }
        }
        if let Some(tokens) = llm.total_tokens {
            if tokens > 100_000 {
                matches.push(Matched {
                    signal_name: "token_spike",
                    signal_type: "tokens",
                    signal_value: tokens as f64,
                    severity: Severity::Medium,
                    metadata: serde_json::json!({"total_tokens": tokens}),
                });
            }
        }
        if let Some(cost) = llm.cost {
            if cost > 10.0 {
                matches.push(Matched {
                    signal_name: "cost_spike",
                    signal_type: "cost",
                    signal_value: cost,
                    severity: Severity::High,
                    metadata: serde_json::json!({"cost": cost}),
                });
            }
        }
    }

    if let Some(tool) = event.attributes.tool_call.as_ref() {
        match tool.result_status {
            Some(ResultStatus::Error) => matches.push(Matched {
                signal_name: "tool_error",
                signal_type: "tool_call",
                signal_value: 1.0,
                severity: Severity::Medium,
                metadata: serde_json::json!({"tool_name": tool.tool_name}),
            }),
            Some(ResultStatus::Timeout) => matches.push(Matched {
                signal_name: "tool_timeout",
                signal_type: "tool_call",
                signal_value: 1.0,
                severity: Severity::High,
                metadata: serde_json::json!({"tool_name": tool.tool_name}),
            }),
            _ => {}
        }
    }

    if event.event_type == EventType::Error && event.attributes.error.is_some() {
        let error = event.attributes.error.as_ref().unwrap();
        matches.push(Matched {
            signal_name: "explicit_error",
            signal_type: "error",
            signal_value: 1.0,
            severity: Severity::High,
            metadata: serde_json::json!({"error_type": error.error_type, "message": error.message}),
        });
    }

    if let Some(meta) = event.scrubbing_metadata.as_ref() {
        if meta.count > 0 {
            matches.push(Matched {
                signal_name: "secret_detected",
                signal_type: "scrubbing",
                signal_value: meta.count as f64,
                severity: Severity::High,
                metadata: serde_json::json!({"categories": meta.categories}),
            });
        }
    }

    matches
}

/// Turns a matched rule into the signal event it produces: same `trace_id`/`span_id` as the
/// trigger, `event_type = error` carrying the `signal` payload variant (§3 Signal, §9).
fn to_signal_event(trigger: &CanonicalEvent, matched: Matched) -> CanonicalEvent {
    CanonicalEvent {
        tenant_id: trigger.tenant_id,
        project_id: trigger.project_id,
        environment: trigger.environment,
        trace_id: trigger.trace_id,
        span_id: trigger.span_id,
        parent_span_id: trigger.parent_span_id,
        timestamp: Utc::now(),
        event_type: EventType::Error,
        conversation_id: trigger.conversation_id.clone(),
        session_id: trigger.session_id.clone(),
        user_id: trigger.user_id.clone(),
        agent_name: trigger.agent_name.clone(),
        version: trigger.version.clone(),
        route: trigger.route.clone(),
        attributes: Attributes {
            signal: Some(SignalAttrs {
                signal_name: matched.signal_name.to_string(),
                signal_type: matched.signal_type.to_string(),
                signal_value: matched.signal_value,
                signal_severity: matched.severity,
                layer: Layer::Layer2,
                metadata: matched.metadata,
            }),
            ..Default::default()
        },
        scrubbing_metadata: None,
    }
}

fn snapshot_for(trigger: &CanonicalEvent, signal_name: &str, severity: Severity) -> TraceSnapshot {
    TraceSnapshot {
        query: trigger.attributes.llm_call.as_ref().and_then(|l| l.input.clone()),
        response: trigger.attributes.llm_call.as_ref().and_then(|l| l.output.clone()),
        retrieved_contexts: trigger
            .attributes
            .retrieval
            .as_ref()
            .and_then(|r| r.context_ids.clone())
            .unwrap_or_default(),
        tool_outputs: trigger
            .attributes
            .tool_call
            .as_ref()
            .and_then(|t| t.result.clone())
            .into_iter()
            .collect(),
        triggering_signal: Some(signal_name.to_string()),
        triggering_severity: Some(severity),
    }
}

/// Runs every rule over `batch`, persists the resulting signal events through the event store
/// adapter (§4.2, same OLAP table), and dispatches medium/high-severity signals to the Layer
/// 3/4 queue (§4.4 Dispatching). Never returns `Err` for a dispatcher failure — only OLAP
/// write failures propagate, since they mean the signal itself was lost.
pub async fn generate_and_persist(deps: &IngestionDeps, batch: Vec<CanonicalEvent>) -> Result<(), AppError> {
    let mut signal_events = Vec::new();
    let mut to_dispatch: Vec<(CanonicalEvent, &'static str, Severity)> = Vec::new();

    for trigger in &batch {
        for matched in evaluate_rules(trigger) {
            let name = matched.signal_name;
            let severity = matched.severity;
            let signal_event = to_signal_event(trigger, matched);
            if severity == Severity::Medium || severity == Severity::High {
                to_dispatch.push((trigger.clone(), name, severity));
            }
            signal_events.push(signal_event);
        }
    }

    if signal_events.is_empty() {
        return Ok(());
    }

    tracing::info!(count = signal_events.len(), "layer-2 signals generated");
    deps.event_store.write_events(&signal_events).await?;

    for (trigger, signal_name, severity) in to_dispatch {
        let snapshot = snapshot_for(&trigger, signal_name, severity);
        let outcome = deps
            .dispatcher
            .queue_for_high_severity(trigger.trace_id, trigger.tenant_id, trigger.project_id, snapshot)
            .await;
        if let crate::models::job::EnqueueOutcome::NotQueued { reason } = outcome {
            tracing::warn!(trace_id = %trigger.trace_id, signal_name, reason, "analysis job not queued");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{Environment, LlmCallAttrs, ToolCallAttrs};
    use uuid::Uuid;

    fn base_event() -> CanonicalEvent {
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
            user_id: None,
            agent_name: None,
            version: None,
            route: None,
            attributes: Attributes::default(),
            scrubbing_metadata: None,
        }
    }

    #[test]
    fn high_latency_trips_high_severity() {
        let mut event = base_event();
        event.attributes.llm_call = Some(LlmCallAttrs {
            latency_ms: Some(6500.0),
            ..Default::default()
        });
        let matched = evaluate_rules(&event);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].signal_name, "high_latency");
        assert_eq!(matched[0].severity, Severity::High);
    }

    #[test]
    fn elevated_and_high_latency_are_mutually_exclusive() {
        let mut event = base_event();
        event.attributes.llm_call = Some(LlmCallAttrs {
            latency_ms: Some(2500.0),
            ..Default::default()
        });
        let matched = evaluate_rules(&event);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].signal_name, "elevated_latency");
    }

    #[test]
    fn tool_timeout_is_high_severity() {
        let mut event = base_event();
        event.event_type = EventType::ToolCall;
        event.attributes.tool_call = Some(ToolCallAttrs {
            result_status: Some(ResultStatus::Timeout),
            ..Default::default()
        });
        let matched = evaluate_rules(&event);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].signal_name, "tool_timeout");
        assert_eq!(matched[0].severity, Severity::High);
    }

    #[test]
    fn cost_and_token_spikes_can_coexist_on_one_event() {
        let mut event = base_event();
        event.attributes.llm_call = Some(LlmCallAttrs {
            cost: Some(11.0),
            total_tokens: Some(150_000),
            ..Default::default()
        });
        let matched = evaluate_rules(&event);
        let names: Vec<_> = matched.iter().map(|m| m.signal_name).collect();
        assert!(names.contains(&"cost_spike"));
        assert!(names.contains(&"token_spike"));
    }

    #[test]
    fn signal_event_reuses_trigger_trace_and_span() {
        let mut event = base_event();
        event.attributes.llm_call = Some(LlmCallAttrs {
            cost: Some(11.0),
            ..Default::default()
        });
        let matched = evaluate_rules(&event).remove(0);
        let signal = to_signal_event(&event, matched);
        assert_eq!(signal.trace_id, event.trace_id);
        assert_eq!(signal.span_id, event.span_id);
        assert_eq!(signal.event_type, EventType::Error);
        assert!(signal.attributes.signal.is_some());
    }
}
