//! Conversation context: the read-only snapshot handed to reasoning logic.
//!
//! A context is built fresh for every generation cycle from the most recent
//! slice of a node's history. Truncation happens here, as a view; the node's
//! stored history is never shortened by building a context.

use parley_core::Event;
use serde_json::{Map, Value};

/// Metadata key: configured window size.
pub const META_MAX_CONTEXT_LENGTH: &str = "max_context_length";
/// Metadata key: number of events in the full history.
pub const META_TOTAL_MESSAGES: &str = "total_messages";
/// Metadata key: number of events in this context.
pub const META_VISIBLE_MESSAGES: &str = "visible_messages";

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub events: Vec<Event>,
    pub system_prompt: String,
    pub metadata: Map<String, Value>,
}

impl ConversationContext {
    pub fn new(events: Vec<Event>, system_prompt: impl Into<String>) -> Self {
        Self {
            events,
            system_prompt: system_prompt.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// One line per event (`kind: {fields}`), optionally limited to the last
    /// `max_messages`.
    pub fn format_events(&self, max_messages: Option<usize>) -> String {
        let start = max_messages
            .map(|n| self.events.len().saturating_sub(n))
            .unwrap_or(0);
        self.events[start..]
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Content of the most recent user transcript, if any.
    pub fn latest_user_transcript(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match event {
            Event::UserTranscriptionReceived { content } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// What was actually said: user transcripts, plus agent speech expressed
    /// as agent responses. Unspoken agent text is left out.
    pub fn committed_transcript(&self) -> Vec<Event> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::UserTranscriptionReceived { .. } => Some(event.clone()),
                Event::AgentSpeechSent { content } => Some(Event::agent_response(content.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }
}
