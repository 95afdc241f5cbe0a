//! Trace reconstruction & query engine (§4.8). Rebuilds the hierarchical span tree from a flat,
//! timestamp-ordered event log fetched from the OLAP store — the sole canonical view (§9
//! "dual-write consistency": OLTP is a derived cache, this module is what "truth" means).
//!
//! Tree assembly is iterative (an index map plus a children map, not a function that recurses
//! over the tree shape), so a 10,000-span trace (B3) does not bound call-stack depth.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::event_store::CanonicalEventRow;
use crate::models::event::{Attributes, CanonicalEvent, Environment, EventType, ResultStatus};
use crate::models::trace::{SpanNode, SpanStatus, TraceDetailResponse, TraceSummary};
use crate::oltp_store;

const NAME_TRUNCATE_LEN: usize = 80;

/// One deduplicated, attribute-parsed event, still flat (pre span-tree assembly).
struct ParsedEvent {
    span_id: Uuid,
    parent_span_id: Option<Uuid>,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    attributes: Attributes,
}

fn parse_row(row: &CanonicalEventRow) -> Option<ParsedEvent> {
    let span_id = Uuid::parse_str(&row.span_id).ok()?;
    let parent_span_id = if row.parent_span_id.is_empty() {
        None
    } else {
        Uuid::parse_str(&row.parent_span_id).ok()
    };
    let event_type = EventType::from_str_loose(&row.event_type)?;

    let attributes: Attributes = if row.attributes_json.trim().is_empty() {
        tracing::warn!(span_id = %span_id, "empty attributes_json, substituting {{}}");
        Attributes::default()
    } else {
        serde_json::from_str(&row.attributes_json).unwrap_or_else(|e| {
            tracing::warn!(span_id = %span_id, error = %e, "malformed attributes_json, substituting {{}}");
            Attributes::default()
        })
    };

    Some(ParsedEvent {
        span_id,
        parent_span_id,
        event_type,
        timestamp: row.timestamp,
        attributes,
    })
}

/// Step 1: dedup by `(span_id, event_type)`, earliest timestamp wins; returns events sorted
/// by timestamp ascending.
fn dedup_and_sort(rows: &[CanonicalEventRow]) -> Vec<ParsedEvent> {
    let mut by_key: HashMap<(Uuid, EventType), ParsedEvent> = HashMap::new();
    for row in rows {
        let Some(parsed) = parse_row(row) else {
            tracing::warn!(span_id = %row.span_id, event_type = %row.event_type, "unparseable event, skipped");
            continue;
        };
        let key = (parsed.span_id, parsed.event_type);
        match by_key.get(&key) {
            Some(existing) if existing.timestamp <= parsed.timestamp => {}
            _ => {
                by_key.insert(key, parsed);
            }
        }
    }
    let mut events: Vec<ParsedEvent> = by_key.into_values().collect();
    events.sort_by_key(|e| e.timestamp);
    events
}

/// Accumulated per-span state while folding all of a span's (deduped) events into one node.
struct NodeBuilder {
    span_id: Uuid,
    parent_span_id: Option<Uuid>,
    timestamp: DateTime<Utc>,
    event_types: Vec<EventType>,
    merged: Attributes,
    error_event_count: usize,
}

fn merge_attrs_field<T: Clone>(into: &mut Option<T>, from: &Option<T>) {
    if into.is_none() {
        *into = from.clone();
    }
}

fn fold_event(builder: &mut NodeBuilder, event: ParsedEvent) {
    if event.timestamp < builder.timestamp {
        builder.timestamp = event.timestamp;
    }
    if builder.parent_span_id.is_none() {
        builder.parent_span_id = event.parent_span_id;
    }
    if event.event_type == EventType::Error {
        builder.error_event_count += 1;
    }
    builder.event_types.push(event.event_type);

    let a = event.attributes;
    merge_attrs_field(&mut builder.merged.llm_call, &a.llm_call);
    merge_attrs_field(&mut builder.merged.tool_call, &a.tool_call);
    merge_attrs_field(&mut builder.merged.retrieval, &a.retrieval);
    merge_attrs_field(&mut builder.merged.embedding, &a.embedding);
    merge_attrs_field(&mut builder.merged.vector_db_operation, &a.vector_db_operation);
    merge_attrs_field(&mut builder.merged.cache_operation, &a.cache_operation);
    merge_attrs_field(&mut builder.merged.agent_create, &a.agent_create);
    merge_attrs_field(&mut builder.merged.error, &a.error);
    merge_attrs_field(&mut builder.merged.output, &a.output);
    merge_attrs_field(&mut builder.merged.feedback, &a.feedback);
    merge_attrs_field(&mut builder.merged.signal, &a.signal);
}

/// Step 5/"Span naming": derives the node's display type, name and attribute payload from
/// whichever typed payload the merged attributes carry, by fixed precedence (errors and
/// signals always win display, since they are the operator-relevant fact about the span).
fn display(builder: &NodeBuilder) -> (&'static str, String, Value) {
    let a = &builder.merged;

    if let Some(signal) = a.signal.as_ref() {
        let detail = signal
            .metadata
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(signal.signal_name.as_str());
        return (
            "error",
            format!("Signal: {} – {}", signal.signal_type, truncate(detail)),
            serde_json::json!({"signal": signal}),
        );
    }
    if let Some(error) = a.error.as_ref() {
        let error_type = error.error_type.as_deref().unwrap_or("unknown");
        let message = error.message.as_deref().unwrap_or("");
        return (
            "error",
            format!("Error: {error_type} – {}", truncate(message)),
            serde_json::to_value(error).unwrap_or(Value::Null),
        );
    }
    if let Some(llm) = a.llm_call.as_ref() {
        let model = llm.model.as_deref().unwrap_or("unknown");
        return ("llm_call", format!("LLM Call: {model}"), serde_json::to_value(llm).unwrap_or(Value::Null));
    }
    if let Some(tool) = a.tool_call.as_ref() {
        let name = tool.tool_name.as_deref().unwrap_or("unknown");
        return ("tool_call", format!("Tool: {name}"), serde_json::to_value(tool).unwrap_or(Value::Null));
    }
    if let Some(retrieval) = a.retrieval.as_ref() {
        return ("retrieval", "Retrieval".to_string(), serde_json::to_value(retrieval).unwrap_or(Value::Null));
    }
    if let Some(embedding) = a.embedding.as_ref() {
        let model = embedding.model.as_deref().unwrap_or("unknown");
        return ("embedding", format!("Embedding: {model}"), serde_json::to_value(embedding).unwrap_or(Value::Null));
    }
    if let Some(vdb) = a.vector_db_operation.as_ref() {
        let op = vdb.operation.as_deref().unwrap_or("operation");
        return ("vector_db_operation", format!("Vector DB: {op}"), serde_json::to_value(vdb).unwrap_or(Value::Null));
    }
    if let Some(cache) = a.cache_operation.as_ref() {
        let op = cache.operation.as_deref().unwrap_or("operation");
        return ("cache_operation", format!("Cache: {op}"), serde_json::to_value(cache).unwrap_or(Value::Null));
    }
    if let Some(agent) = a.agent_create.as_ref() {
        let ty = agent.agent_type.as_deref().unwrap_or("agent");
        return ("agent_create", format!("Agent: {ty}"), serde_json::to_value(agent).unwrap_or(Value::Null));
    }
    if let Some(output) = a.output.as_ref() {
        return ("output", "Output".to_string(), serde_json::to_value(output).unwrap_or(Value::Null));
    }
    if let Some(feedback) = a.feedback.as_ref() {
        return ("feedback", "Feedback".to_string(), serde_json::to_value(feedback).unwrap_or(Value::Null));
    }
    ("trace", "Trace".to_string(), Value::Null)
}

fn truncate(s: &str) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(NAME_TRUNCATE_LEN).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Step 6: derives per-node status. Timeout is checked ahead of the generic error condition
/// since it is the more specific diagnosis.
fn status(builder: &NodeBuilder) -> SpanStatus {
    let a = &builder.merged;
    if matches!(a.tool_call.as_ref().and_then(|t| t.result_status), Some(ResultStatus::Timeout)) {
        return SpanStatus::Timeout;
    }
    let tool_error = matches!(a.tool_call.as_ref().and_then(|t| t.result_status), Some(ResultStatus::Error));
    let llm_error_finish = a.llm_call.as_ref().and_then(|l| l.finish_reason.as_deref()) == Some("error");
    if builder.error_event_count > 0 || tool_error || llm_error_finish {
        return SpanStatus::Error;
    }
    SpanStatus::Success
}

/// Full result of reconstructing one trace: the assembled tree plus whether I1 was violated.
pub struct Reconstructed {
    pub roots: Vec<SpanNode>,
    pub span_count: usize,
    pub malformed: bool,
}

/// Steps 2–6: builds the span tree from deduplicated events. Iterative throughout (B3).
pub fn reconstruct_tree(events: Vec<ParsedEventPublic>) -> Reconstructed {
    reconstruct_tree_inner(events.into_iter().map(|e| e.0).collect())
}

/// Newtype so callers outside this module can't construct a `ParsedEvent` directly —
/// only via `events_from_rows`, which guarantees the dedup/sort invariant already holds.
pub struct ParsedEventPublic(ParsedEvent);

pub fn events_from_rows(rows: &[CanonicalEventRow]) -> Vec<ParsedEventPublic> {
    dedup_and_sort(rows).into_iter().map(ParsedEventPublic).collect()
}

fn reconstruct_tree_inner(events: Vec<ParsedEvent>) -> Reconstructed {
    let mut builders: HashMap<Uuid, NodeBuilder> = HashMap::new();
    let mut order: Vec<Uuid> = Vec::new();
    let mut trace_start_roots = 0usize;
    let mut trace_end_count = 0usize;

    for event in events {
        if event.event_type == EventType::TraceEnd {
            trace_end_count += 1;
        }
        if event.event_type == EventType::TraceStart && event.parent_span_id.is_none() {
            trace_start_roots += 1;
        }

        let span_id = event.span_id;
        if !builders.contains_key(&span_id) {
            order.push(span_id);
        }
        let builder = builders.entry(span_id).or_insert_with(|| NodeBuilder {
            span_id,
            parent_span_id: None,
            timestamp: event.timestamp,
            event_types: Vec::new(),
            merged: Attributes::default(),
            error_event_count: 0,
        });
        fold_event(builder, event);
    }

    let malformed = trace_end_count > 1 || trace_start_roots > 1;

    // Children map + root detection. A parent reference to a span outside this window is an
    // orphan: displayed as a root but flagged.
    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut roots: Vec<Uuid> = Vec::new();
    let mut orphans: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

    for span_id in &order {
        let builder = &builders[span_id];
        match builder.parent_span_id {
            None => roots.push(*span_id),
            Some(parent) if builders.contains_key(&parent) => {
                children.entry(parent).or_default().push(*span_id);
            }
            Some(_unresolved) => {
                roots.push(*span_id);
                orphans.insert(*span_id);
            }
        }
    }

    // Iterative post-order build: no recursion over tree shape (B3).
    let span_count = order.len();
    let mut owned: HashMap<Uuid, SpanNode> = HashMap::with_capacity(span_count);
    let mut stack: Vec<(Uuid, bool)> = order.iter().rev().map(|id| (*id, false)).collect();

    while let Some((span_id, children_done)) = stack.pop() {
        if children_done {
            let builder = &builders[&span_id];
            let (event_type, name, attrs) = display(builder);
            let child_ids = children.get(&span_id).cloned().unwrap_or_default();
            let node_children = child_ids
                .iter()
                .filter_map(|c| owned.remove(c))
                .collect::<Vec<_>>();
            owned.insert(
                span_id,
                SpanNode {
                    span_id,
                    parent_span_id: builder.parent_span_id,
                    event_type: event_type.to_string(),
                    name,
                    status: status(builder),
                    timestamp: builder.timestamp,
                    attributes: attrs,
                    orphan: orphans.contains(&span_id),
                    children: node_children,
                },
            );
            continue;
        }
        stack.push((span_id, true));
        if let Some(kids) = children.get(&span_id) {
            for kid in kids {
                stack.push((*kid, false));
            }
        }
    }

    let mut root_nodes: Vec<SpanNode> = roots.iter().filter_map(|r| owned.remove(r)).collect();
    root_nodes.sort_by_key(|n| n.timestamp);

    // Edge case: no `trace_start` root and more than one top-level node — synthesize a
    // virtual root so the tree stays single-rooted.
    if trace_start_roots == 0 && root_nodes.len() > 1 {
        let min_ts = root_nodes.iter().map(|n| n.timestamp).min().unwrap_or_else(Utc::now);
        let virtual_root = SpanNode {
            span_id: Uuid::nil(),
            parent_span_id: None,
            event_type: "trace".to_string(),
            name: "Trace".to_string(),
            status: SpanStatus::Success,
            timestamp: min_ts,
            attributes: Value::Null,
            orphan: false,
            children: root_nodes,
        };
        return Reconstructed {
            roots: vec![virtual_root],
            span_count,
            malformed,
        };
    }

    Reconstructed {
        roots: root_nodes,
        span_count,
        malformed,
    }
}

/// Full `trace_detail(trace_id)` operation (§4.8): fetch, reconstruct, and compute the summary
/// from the same event list, so the detail response and `listTraces` never disagree (R2).
pub fn build_trace_detail(
    tenant_id: Uuid,
    project_id: Uuid,
    trace_id: Uuid,
    rows: Vec<CanonicalEventRow>,
) -> Option<TraceDetailResponse> {
    if rows.is_empty() {
        return None;
    }

    let canonical_events: Vec<CanonicalEvent> = rows
        .iter()
        .filter_map(|r| row_to_canonical(r))
        .collect();

    let parsed = events_from_rows(&rows);
    let reconstructed = reconstruct_tree(parsed);

    let mut summary = oltp_store::compute_trace_summary(tenant_id, project_id, trace_id, &canonical_events);
    summary.malformed = reconstructed.malformed;

    Some(TraceDetailResponse {
        trace_id,
        roots: reconstructed.roots,
        span_count: reconstructed.span_count,
        summary,
        malformed: reconstructed.malformed,
    })
}

/// Rehydrates a stored row back into a `CanonicalEvent` for summary extraction, tolerating
/// the same malformed-JSON cases as `parse_row`.
fn row_to_canonical(row: &CanonicalEventRow) -> Option<CanonicalEvent> {
    let tenant_id = Uuid::parse_str(&row.tenant_id).ok()?;
    let project_id = Uuid::parse_str(&row.project_id).ok()?;
    let trace_id = Uuid::parse_str(&row.trace_id).ok()?;
    let span_id = Uuid::parse_str(&row.span_id).ok()?;
    let parent_span_id = if row.parent_span_id.is_empty() {
        None
    } else {
        Uuid::parse_str(&row.parent_span_id).ok()
    };
    let event_type = EventType::from_str_loose(&row.event_type)?;
    let environment = if row.environment == "prod" { Environment::Prod } else { Environment::Dev };
    let attributes: Attributes = serde_json::from_str(&row.attributes_json).unwrap_or_default();

    let opt = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };

    Some(CanonicalEvent {
        tenant_id,
        project_id,
        environment,
        trace_id,
        span_id,
        parent_span_id,
        timestamp: row.timestamp,
        event_type,
        conversation_id: opt(&row.conversation_id),
        session_id: opt(&row.session_id),
        user_id: opt(&row.user_id),
        agent_name: opt(&row.agent_name),
        version: opt(&row.version),
        route: opt(&row.route),
        attributes,
        scrubbing_metadata: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::to_row;
    use crate::models::event::{Environment, LlmCallAttrs};
    use chrono::Duration;

    fn row(
        trace_id: Uuid,
        span_id: Uuid,
        parent: Option<Uuid>,
        event_type: EventType,
        ts: DateTime<Utc>,
        attrs: Attributes,
    ) -> CanonicalEventRow {
        let event = CanonicalEvent {
            tenant_id: Uuid::nil(),
            project_id: Uuid::nil(),
            environment: Environment::Prod,
            trace_id,
            span_id,
            parent_span_id: parent,
            timestamp: ts,
            event_type,
            conversation_id: None,
            session_id: None,
            user_id: None,
            agent_name: None,
            version: None,
            route: None,
            attributes: attrs,
            scrubbing_metadata: None,
        };
        to_row(&event)
    }

    #[test]
    fn simple_llm_call_builds_two_node_tree() {
        let trace_id = Uuid::new_v4();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        let t0 = Utc::now();

        let rows = vec![
            row(trace_id, root, None, EventType::TraceStart, t0, Attributes::default()),
            row(
                trace_id,
                child,
                Some(root),
                EventType::LlmCall,
                t0 + Duration::milliseconds(100),
                Attributes {
                    llm_call: Some(LlmCallAttrs {
                        model: Some("gpt-4".to_string()),
                        input: Some("hi".to_string()),
                        output: Some("hello".to_string()),
                        total_tokens: Some(5),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            row(trace_id, root, None, EventType::TraceEnd, t0 + Duration::seconds(1), Attributes::default()),
        ];

        let detail = build_trace_detail(Uuid::nil(), Uuid::nil(), trace_id, rows).unwrap();
        assert_eq!(detail.span_count, 2);
        assert_eq!(detail.roots.len(), 1);
        assert_eq!(detail.roots[0].span_id, root);
        assert_eq!(detail.roots[0].children.len(), 1);
        assert_eq!(detail.roots[0].children[0].name, "LLM Call: gpt-4");
        assert_eq!(detail.summary.query.as_deref(), Some("hi"));
        assert_eq!(detail.summary.total_tokens, 5);
        assert!(!detail.malformed);
    }

    #[test]
    fn orphan_parent_is_flagged_as_root() {
        let trace_id = Uuid::new_v4();
        let child = Uuid::new_v4();
        let missing_parent = Uuid::new_v4();
        let rows = vec![row(
            trace_id,
            child,
            Some(missing_parent),
            EventType::LlmCall,
            Utc::now(),
            Attributes::default(),
        )];

        let detail = build_trace_detail(Uuid::nil(), Uuid::nil(), trace_id, rows).unwrap();
        assert_eq!(detail.roots.len(), 1);
        assert!(detail.roots[0].orphan);
    }

    #[test]
    fn duplicate_trace_end_is_flagged_malformed() {
        let trace_id = Uuid::new_v4();
        let root = Uuid::new_v4();
        let t0 = Utc::now();
        let rows = vec![
            row(trace_id, root, None, EventType::TraceStart, t0, Attributes::default()),
            row(trace_id, root, None, EventType::TraceEnd, t0 + Duration::seconds(1), Attributes::default()),
            row(trace_id, root, None, EventType::TraceEnd, t0 + Duration::seconds(2), Attributes::default()),
        ];
        let detail = build_trace_detail(Uuid::nil(), Uuid::nil(), trace_id, rows).unwrap();
        assert!(detail.malformed);
        assert!(detail.summary.malformed);
    }

    #[test]
    fn no_trace_start_with_multiple_roots_synthesizes_virtual_root() {
        let trace_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let t0 = Utc::now();
        let rows = vec![
            row(trace_id, a, None, EventType::LlmCall, t0, Attributes::default()),
            row(trace_id, b, None, EventType::LlmCall, t0 + Duration::milliseconds(50), Attributes::default()),
        ];
        let detail = build_trace_detail(Uuid::nil(), Uuid::nil(), trace_id, rows).unwrap();
        assert_eq!(detail.roots.len(), 1);
        assert_eq!(detail.roots[0].span_id, Uuid::nil());
        assert_eq!(detail.roots[0].children.len(), 2);
    }

    #[test]
    fn tool_timeout_status_takes_precedence_over_generic_error() {
        let trace_id = Uuid::new_v4();
        let span_id = Uuid::new_v4();
        use crate::models::event::ToolCallAttrs;
        let rows = vec![row(
            trace_id,
            span_id,
            None,
            EventType::ToolCall,
            Utc::now(),
            Attributes {
                tool_call: Some(ToolCallAttrs {
                    result_status: Some(ResultStatus::Timeout),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )];
        let detail = build_trace_detail(Uuid::nil(), Uuid::nil(), trace_id, rows).unwrap();
        assert_eq!(detail.roots[0].status, SpanStatus::Timeout);
    }
}
