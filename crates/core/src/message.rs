//! Bus message envelope and node identity.
//!
//! Business logic operates on [`Event`]s; the bus wraps every published event
//! in a [`Message`] that records who published it and where it sits in the
//! publish order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::event::{Event, EventKind};

/// Stable identity of a node (or of the harness) on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event plus its provenance.
#[derive(Debug, Clone)]
pub struct Message {
    /// Monotonic publish sequence, unique per bus (starts at 1).
    pub id: u64,

    /// The node that published the event.
    pub source: NodeId,

    /// The event itself. Shared, never mutated.
    pub event: Arc<Event>,

    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(id: u64, source: NodeId, event: Event) -> Self {
        Self {
            id,
            source,
            event: Arc::new(event),
            timestamp: Utc::now(),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
        assert_eq!(NodeId::from("harness").to_string(), "harness");
    }

    #[test]
    fn message_exposes_event() {
        let msg = Message::new(7, NodeId::from("n1"), Event::user_transcript("hi"));
        assert_eq!(msg.id, 7);
        assert_eq!(msg.kind(), EventKind::UserTranscriptionReceived);
        assert_eq!(msg.event().content(), Some("hi"));

        let copy = msg.clone();
        assert!(Arc::ptr_eq(&msg.event, &copy.event));
    }
}
