//! Wire protocol between the transport peer and the agent.
//!
//! Both directions are JSON objects discriminated by a `type` field.
//!
//! Inbound (peer → agent):
//! - `message`: final user transcript
//! - `dtmf`: keypad button pressed
//! - `user_state`: user started (`speaking`) or stopped (`idle`) talking
//! - `agent_state`: same, for agent playback
//! - `validation_error`: peer rejected something we sent
//! - `agent_speech`: text that was actually spoken
//! - `custom`: free-form metadata
//!
//! Outbound (agent → peer): `error`, `dtmf`, `message`, `tool_call`,
//! `transfer`, `end_call`, `log_event`, `log_metric`.

use parley_core::{Event, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Voice activity reported by `user_state` / `agent_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Speaking,
    Idle,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputMessage {
    Message {
        content: String,
    },
    Dtmf {
        button: String,
    },
    UserState {
        value: ActivityState,
    },
    AgentState {
        value: ActivityState,
    },
    ValidationError {
        error_message: String,
        error_type: String,
    },
    AgentSpeech {
        content: String,
    },
    Custom {
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Valid JSON that matches none of the shapes above.
    #[serde(skip)]
    Unknown(Value),
}

impl InputMessage {
    /// Decode one inbound frame.
    ///
    /// Malformed JSON is an error; well-formed JSON of an unknown shape
    /// becomes [`InputMessage::Unknown`] so it is never silently lost.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(message) => Ok(message),
            Err(e) => {
                debug!(error = %e, "Inbound message has an unknown shape");
                Ok(Self::Unknown(value))
            }
        }
    }

    /// Convert to bus events.
    pub fn to_events(&self) -> Vec<Event> {
        match self {
            Self::UserState { value } => match value {
                ActivityState::Speaking => {
                    info!("User started speaking");
                    vec![Event::UserStartedSpeaking]
                }
                ActivityState::Idle => {
                    info!("User stopped speaking");
                    vec![Event::UserStoppedSpeaking]
                }
                ActivityState::Other => {
                    debug!("Ignoring unrecognized user state");
                    Vec::new()
                }
            },
            Self::Message { content } => {
                info!(content = %content, "User said");
                vec![Event::user_transcript(content.clone())]
            }
            Self::AgentState { value } => match value {
                ActivityState::Speaking => {
                    info!("Agent started speaking");
                    vec![Event::AgentStartedSpeaking]
                }
                ActivityState::Idle => {
                    info!("Agent stopped speaking");
                    vec![Event::AgentStoppedSpeaking]
                }
                ActivityState::Other => {
                    debug!("Ignoring unrecognized agent state");
                    Vec::new()
                }
            },
            Self::AgentSpeech { content } => {
                info!(content = %content, "Agent speech sent");
                vec![Event::agent_speech(content.clone())]
            }
            Self::Dtmf { button } => {
                info!(button = %button, "DTMF received");
                vec![Event::DtmfInput {
                    button: button.clone(),
                }]
            }
            Self::Custom { metadata } => {
                info!(keys = metadata.len(), "Custom event received");
                vec![Event::CustomReceived {
                    metadata: metadata.clone(),
                }]
            }
            Self::ValidationError { .. } | Self::Unknown(_) => {
                let input_data = self.raw_json();
                warn!(input = %input_data, "Unhandled inbound message");
                vec![Event::UserUnknownInputReceived { input_data }]
            }
        }
    }

    fn raw_json(&self) -> String {
        match self {
            Self::Unknown(value) => value.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMessage {
    Error {
        content: String,
    },
    Dtmf {
        button: String,
    },
    Message {
        content: String,
    },
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Transfer {
        target_phone_number: String,
    },
    EndCall,
    LogEvent {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
    LogMetric {
        name: String,
        value: Value,
    },
}

impl OutputMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// The `type` discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::Dtmf { .. } => "dtmf",
            Self::Message { .. } => "message",
            Self::ToolCall { .. } => "tool_call",
            Self::Transfer { .. } => "transfer",
            Self::EndCall => "end_call",
            Self::LogEvent { .. } => "log_event",
            Self::LogMetric { .. } => "log_metric",
        }
    }
}
