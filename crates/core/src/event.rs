//! Typed conversation events.
//!
//! An [`Event`] is an immutable fact about something that happened during a
//! call: the user spoke, the agent answered, a tool ran, the call should be
//! transferred. Routing never looks at payloads directly; it works with the
//! fieldless [`EventKind`] mirror of each variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transfer grace period used when a `TransferCall` does not carry one.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 30;

/// All events that can travel over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Agent text to be sent to the user.
    AgentResponse {
        content: String,
        #[serde(default = "default_chunk_type")]
        chunk_type: String,
    },

    /// Agent speech that was actually synthesized and played.
    AgentSpeechSent { content: String },

    /// Final transcript of something the user said.
    UserTranscriptionReceived { content: String },

    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentStartedSpeaking,
    AgentStoppedSpeaking,

    /// The model requested a tool invocation.
    ToolCall(ToolCall),

    /// A tool finished (successfully or not).
    ToolResult(ToolResult),

    /// Synthetic marker emitted after every generation cycle.
    AgentGenerationComplete,

    EndCall,

    /// Transfer the caller to another number, then shut down after the grace period.
    TransferCall {
        target_phone_number: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },

    AgentHandoff {
        target_agent: String,
        #[serde(default)]
        reason: String,
    },

    /// Change the authorized agent.
    Authorize { agent: String },

    /// Error to surface to the user.
    AgentError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Inbound traffic that did not match any known message shape.
    UserUnknownInputReceived { input_data: String },

    CustomReceived {
        metadata: serde_json::Map<String, serde_json::Value>,
    },

    LogMetric {
        name: String,
        value: serde_json::Value,
    },

    DtmfInput { button: String },
    DtmfOutput { button: String },
    DtmfStopped,

    /// Application-defined event, routed by its name.
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

fn default_chunk_type() -> String {
    "text".into()
}

/// Tool execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,

    #[serde(default)]
    pub tool_args: serde_json::Map<String, serde_json::Value>,

    #[serde(default = "new_tool_call_id")]
    pub tool_call_id: String,

    #[serde(default)]
    pub raw_response: serde_json::Map<String, serde_json::Value>,
}

fn new_tool_call_id() -> String {
    Uuid::new_v4().to_string()
}

impl ToolCall {
    pub fn new(
        tool_name: impl Into<String>,
        tool_args: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
            tool_call_id: new_tool_call_id(),
            raw_response: serde_json::Map::new(),
        }
    }
}

/// Tool execution result. Appears in the agent's current turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub tool_name: String,

    #[serde(default)]
    pub tool_args: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error message if the tool failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    /// The `ToolCall` that triggered this result, if one was emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ToolResult {
    pub fn new(
        tool_name: impl Into<String>,
        tool_args: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// JSON text of the result, if there is one.
    pub fn result_str(&self) -> Option<String> {
        self.result.as_ref().map(|r| r.to_string())
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

impl Event {
    pub fn agent_response(content: impl Into<String>) -> Self {
        Self::AgentResponse {
            content: content.into(),
            chunk_type: default_chunk_type(),
        }
    }

    pub fn agent_speech(content: impl Into<String>) -> Self {
        Self::AgentSpeechSent {
            content: content.into(),
        }
    }

    pub fn user_transcript(content: impl Into<String>) -> Self {
        Self::UserTranscriptionReceived {
            content: content.into(),
        }
    }

    pub fn transfer(target_phone_number: impl Into<String>, timeout_secs: Option<u64>) -> Self {
        Self::TransferCall {
            target_phone_number: target_phone_number.into(),
            timeout_secs,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::AgentError {
            error: error.into(),
            code: None,
        }
    }

    pub fn custom(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Custom {
            name: name.into(),
            payload,
        }
    }

    /// The routing kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentResponse { .. } => EventKind::AgentResponse,
            Self::AgentSpeechSent { .. } => EventKind::AgentSpeechSent,
            Self::UserTranscriptionReceived { .. } => EventKind::UserTranscriptionReceived,
            Self::UserStartedSpeaking => EventKind::UserStartedSpeaking,
            Self::UserStoppedSpeaking => EventKind::UserStoppedSpeaking,
            Self::AgentStartedSpeaking => EventKind::AgentStartedSpeaking,
            Self::AgentStoppedSpeaking => EventKind::AgentStoppedSpeaking,
            Self::ToolCall(_) => EventKind::ToolCall,
            Self::ToolResult(_) => EventKind::ToolResult,
            Self::AgentGenerationComplete => EventKind::AgentGenerationComplete,
            Self::EndCall => EventKind::EndCall,
            Self::TransferCall { .. } => EventKind::TransferCall,
            Self::AgentHandoff { .. } => EventKind::AgentHandoff,
            Self::Authorize { .. } => EventKind::Authorize,
            Self::AgentError { .. } => EventKind::AgentError,
            Self::UserUnknownInputReceived { .. } => EventKind::UserUnknownInputReceived,
            Self::CustomReceived { .. } => EventKind::CustomReceived,
            Self::LogMetric { .. } => EventKind::LogMetric,
            Self::DtmfInput { .. } => EventKind::DtmfInput,
            Self::DtmfOutput { .. } => EventKind::DtmfOutput,
            Self::DtmfStopped => EventKind::DtmfStopped,
            Self::Custom { name, .. } => EventKind::Custom(name.clone()),
        }
    }

    /// Text content for the textual variants.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::AgentResponse { content, .. }
            | Self::AgentSpeechSent { content }
            | Self::UserTranscriptionReceived { content } => Some(content),
            _ => None,
        }
    }

    /// Whether consecutive events of this kind collapse into one history entry.
    pub fn is_mergeable(&self) -> bool {
        self.kind().is_mergeable()
    }

    /// Append `next`'s content onto `self` when both are the same mergeable kind.
    ///
    /// Returns `false` (and leaves `self` untouched) otherwise.
    pub fn try_merge(&mut self, next: &Event) -> bool {
        match (self, next) {
            (Self::AgentResponse { content, .. }, Self::AgentResponse { content: more, .. })
            | (Self::AgentSpeechSent { content }, Self::AgentSpeechSent { content: more })
            | (
                Self::UserTranscriptionReceived { content },
                Self::UserTranscriptionReceived { content: more },
            ) => {
                content.push_str(more);
                true
            }
            _ => false,
        }
    }

    /// The event's fields as a JSON object, without the `type` tag.
    pub fn fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("type");
                map
            }
            _ => serde_json::Map::new(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields();
        if fields.is_empty() {
            write!(f, "{}", self.kind())
        } else {
            write!(f, "{}: {}", self.kind(), serde_json::Value::Object(fields))
        }
    }
}

/// Fieldless mirror of [`Event`] used for triggers, interrupts and filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentResponse,
    AgentSpeechSent,
    UserTranscriptionReceived,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentStartedSpeaking,
    AgentStoppedSpeaking,
    ToolCall,
    ToolResult,
    AgentGenerationComplete,
    EndCall,
    TransferCall,
    AgentHandoff,
    Authorize,
    AgentError,
    UserUnknownInputReceived,
    CustomReceived,
    LogMetric,
    DtmfInput,
    DtmfOutput,
    DtmfStopped,
    Custom(String),
}

impl EventKind {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn is_mergeable(&self) -> bool {
        matches!(
            self,
            Self::AgentResponse | Self::AgentSpeechSent | Self::UserTranscriptionReceived
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentResponse => "agent_response",
            Self::AgentSpeechSent => "agent_speech_sent",
            Self::UserTranscriptionReceived => "user_transcription_received",
            Self::UserStartedSpeaking => "user_started_speaking",
            Self::UserStoppedSpeaking => "user_stopped_speaking",
            Self::AgentStartedSpeaking => "agent_started_speaking",
            Self::AgentStoppedSpeaking => "agent_stopped_speaking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::AgentGenerationComplete => "agent_generation_complete",
            Self::EndCall => "end_call",
            Self::TransferCall => "transfer_call",
            Self::AgentHandoff => "agent_handoff",
            Self::Authorize => "authorize",
            Self::AgentError => "agent_error",
            Self::UserUnknownInputReceived => "user_unknown_input_received",
            Self::CustomReceived => "custom_received",
            Self::LogMetric => "log_metric",
            Self::DtmfInput => "dtmf_input",
            Self::DtmfOutput => "dtmf_output",
            Self::DtmfStopped => "dtmf_stopped",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "custom:{name}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    Any,
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        let mut out: Vec<EventKind> = Vec::new();
        for kind in kinds {
            if !out.contains(&kind) {
                out.push(kind);
            }
        }
        Self::Kinds(out)
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Any => true,
            Self::Kinds(kinds) => {
                let kind = event.kind();
                kinds.iter().any(|k| *k == kind)
            }
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kinds(vec![kind])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_string(&Event::user_transcript("hello")).unwrap();
        assert!(json.contains(r#""type":"user_transcription_received""#));
        assert!(json.contains(r#""content":"hello""#));
    }

    #[test]
    fn deserializes_defaults() {
        let event: Event =
            serde_json::from_str(r#"{"type":"agent_response","content":"hi"}"#).unwrap();
        match event {
            Event::AgentResponse { content, chunk_type } => {
                assert_eq!(content, "hi");
                assert_eq!(chunk_type, "text");
            }
            other => panic!("Expected AgentResponse, got {other:?}"),
        }
    }

    #[test]
    fn merge_same_textual_kind() {
        let mut first = Event::agent_response("Hello, ");
        assert!(first.try_merge(&Event::agent_response("world")));
        assert_eq!(first.content(), Some("Hello, world"));
    }

    #[test]
    fn merge_rejects_different_kinds() {
        let mut first = Event::agent_response("Hello");
        assert!(!first.try_merge(&Event::agent_speech("Hello")));
        assert!(!first.try_merge(&Event::EndCall));
        assert_eq!(first.content(), Some("Hello"));

        let mut end = Event::EndCall;
        assert!(!end.try_merge(&Event::EndCall));
    }

    #[test]
    fn mergeable_set() {
        assert!(Event::agent_response("a").is_mergeable());
        assert!(Event::agent_speech("a").is_mergeable());
        assert!(Event::user_transcript("a").is_mergeable());
        assert!(!Event::UserStartedSpeaking.is_mergeable());
        assert!(!Event::ToolResult(ToolResult::default()).is_mergeable());
    }

    #[test]
    fn custom_kind_uses_name() {
        let event = Event::custom("escalation_alert", serde_json::json!({"urgency": "high"}));
        assert_eq!(event.kind(), EventKind::custom("escalation_alert"));
        assert_eq!(event.kind().to_string(), "custom:escalation_alert");
    }

    #[test]
    fn tool_result_helpers() {
        let ok = ToolResult::new("lookup", serde_json::Map::new())
            .with_result(serde_json::json!({"answer": 42}));
        assert!(ok.success());
        assert_eq!(ok.result_str().as_deref(), Some(r#"{"answer":42}"#));

        let failed = ToolResult::new("lookup", serde_json::Map::new()).with_error("timeout");
        assert!(!failed.success());
        assert_eq!(failed.result_str(), None);
    }

    #[test]
    fn tool_call_gets_unique_id() {
        let a = ToolCall::new("end_call", serde_json::Map::new());
        let b = ToolCall::new("end_call", serde_json::Map::new());
        assert_ne!(a.tool_call_id, b.tool_call_id);
    }

    #[test]
    fn fields_drop_type_tag() {
        let fields = Event::LogMetric {
            name: "latency_ms".into(),
            value: serde_json::json!(120),
        }
        .fields();
        assert_eq!(fields.get("name"), Some(&serde_json::json!("latency_ms")));
        assert!(!fields.contains_key("type"));
    }

    #[test]
    fn filter_matches_kinds() {
        let filter = EventFilter::kinds([EventKind::UserStartedSpeaking, EventKind::EndCall]);
        assert!(filter.matches(&Event::UserStartedSpeaking));
        assert!(filter.matches(&Event::EndCall));
        assert!(!filter.matches(&Event::UserStoppedSpeaking));
        assert!(EventFilter::Any.matches(&Event::DtmfStopped));
    }

    #[test]
    fn filter_dedups_kinds() {
        let filter = EventFilter::kinds([EventKind::EndCall, EventKind::EndCall]);
        assert_eq!(filter, EventFilter::Kinds(vec![EventKind::EndCall]));
    }
}
