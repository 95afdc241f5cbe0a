use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The atomic unit ingested by this service. Immutable once accepted (§3, I5).
///
/// `attributes` is a sum type over event variants rather than a dynamic JSON bag: each
/// event_type has exactly one populated `Option<...Attrs>` field, plus an `extensions`
/// catch-all for forward compatibility. Serializing back down to the OLAP store still
/// collapses this to a single `attributes_json` string column (see `event_store`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub environment: Environment,

    pub trace_id: Uuid,
    pub span_id: Uuid,
    #[serde(default)]
    pub parent_span_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    pub event_type: EventType,

    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub route: Option<String>,

    #[serde(default)]
    pub attributes: Attributes,

    /// Populated by the scrubbing pass (§4.6); absent on the wire, present once accepted.
    #[serde(default)]
    pub scrubbing_metadata: Option<ScrubbingMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TraceStart,
    TraceEnd,
    LlmCall,
    ToolCall,
    Retrieval,
    Embedding,
    VectorDbOperation,
    CacheOperation,
    AgentCreate,
    Error,
    Output,
    Feedback,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TraceStart => "trace_start",
            EventType::TraceEnd => "trace_end",
            EventType::LlmCall => "llm_call",
            EventType::ToolCall => "tool_call",
            EventType::Retrieval => "retrieval",
            EventType::Embedding => "embedding",
            EventType::VectorDbOperation => "vector_db_operation",
            EventType::CacheOperation => "cache_operation",
            EventType::AgentCreate => "agent_create",
            EventType::Error => "error",
            EventType::Output => "output",
            EventType::Feedback => "feedback",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        Some(match s {
            "trace_start" => EventType::TraceStart,
            "trace_end" => EventType::TraceEnd,
            "llm_call" => EventType::LlmCall,
            "tool_call" => EventType::ToolCall,
            "retrieval" => EventType::Retrieval,
            "embedding" => EventType::Embedding,
            "vector_db_operation" => EventType::VectorDbOperation,
            "cache_operation" => EventType::CacheOperation,
            "agent_create" => EventType::AgentCreate,
            "error" => EventType::Error,
            "output" => EventType::Output,
            "feedback" => EventType::Feedback,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub llm_call: Option<LlmCallAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call: Option<ToolCallAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retrieval: Option<RetrievalAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<EmbeddingAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vector_db_operation: Option<VectorDbOperationAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_operation: Option<CacheOperationAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_create: Option<AgentCreateAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<OutputAttrs>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub feedback: Option<FeedbackAttrs>,
    /// Populated only on backend-emitted signal events (§3 Signal, §9 signal-as-error).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signal: Option<SignalAttrs>,
    /// Forward-compatible catch-all; never interpreted, always carried through.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmCallAttrs {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default)]
    pub streaming_duration_ms: Option<f64>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub response_model: Option<String>,
    #[serde(default)]
    pub input_messages: Option<Value>,
    #[serde(default)]
    pub output_messages: Option<Value>,
    #[serde(default)]
    pub system_instructions: Option<String>,
    #[serde(default)]
    pub server_address: Option<String>,
    #[serde(default)]
    pub server_port: Option<u16>,
    #[serde(default)]
    pub cost_breakdown: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallAttrs {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub result_status: Option<ResultStatus>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalAttrs {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub context_ids: Option<Vec<String>>,
    #[serde(default)]
    pub context_hashes: Option<Vec<String>>,
    #[serde(default)]
    pub k: Option<u32>,
    #[serde(default)]
    pub similarity_scores: Option<Vec<f64>>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingAttrs {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub dimensions: Option<u32>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorDbOperationAttrs {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub result_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOperationAttrs {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hit: Option<bool>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCreateAttrs {
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorAttrs {
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputAttrs {
    #[serde(default)]
    pub final_output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackAttrs {
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Layer2,
    Layer3,
    Layer4,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Layer2 => "layer2",
            Layer::Layer3 => "layer3",
            Layer::Layer4 => "layer4",
        }
    }
}

/// The backend-owned payload carried by a signal event (§3 Signal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAttrs {
    pub signal_name: String,
    pub signal_type: String,
    pub signal_value: f64,
    pub signal_severity: Severity,
    pub layer: Layer,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrubbingMetadata {
    pub count: u32,
    pub categories: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_wire_names() {
        for et in [
            EventType::TraceStart,
            EventType::LlmCall,
            EventType::ToolCall,
            EventType::VectorDbOperation,
            EventType::Feedback,
        ] {
            let parsed = EventType::from_str_loose(et.as_str());
            assert_eq!(parsed, Some(et));
        }
    }

    #[test]
    fn unknown_attributes_key_lands_in_extensions() {
        let json = serde_json::json!({
            "llm_call": {"model": "gpt-4"},
            "future_field": {"x": 1}
        });
        let attrs: Attributes = serde_json::from_value(json).unwrap();
        assert_eq!(attrs.llm_call.unwrap().model.as_deref(), Some("gpt-4"));
        assert!(attrs.extensions.contains_key("future_field"));
    }
}
