//! Error types for the parley runtime.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context (bus, wiring, nodes, transport, protocol) has its own enum.

use thiserror::Error;

use crate::event::EventKind;

/// The top-level error type for all parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Bus errors ---
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    // --- Wiring errors (fatal before a call starts) ---
    #[error("Wiring error: {0}")]
    Wiring(#[from] WiringError),

    // --- Node errors ---
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Wire protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,

    #[error("Subscription not found: {0}")]
    UnknownSubscription(u64),

    #[error("Handler '{subscriber}' failed: {reason}")]
    HandlerFailed { subscriber: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum WiringError {
    #[error("Event kind {kind} already registered with alias '{existing}'")]
    DuplicateAlias { kind: EventKind, existing: String },

    #[error("Alias '{0}' is empty")]
    EmptyAlias(String),

    #[error("Route on {trigger} has no map or stream stage")]
    EmptyRoute { trigger: EventKind },

    #[error("Route on {trigger} declares {stage} more than once")]
    DuplicateStage {
        trigger: EventKind,
        stage: &'static str,
    },

    #[error("Route on {trigger} declares interrupt_on({interrupt}) without a stream stage")]
    InterruptWithoutStream {
        trigger: EventKind,
        interrupt: EventKind,
    },

    #[error("Route on {trigger} uses the same kind as its own interrupt")]
    SelfInterrupt { trigger: EventKind },

    #[error("Node '{0}' is registered more than once")]
    DuplicateNode(String),

    #[error("Speaking node already set to '{0}'")]
    SpeakingNodeTaken(String),

    #[error("System already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("Reasoning failed in node '{node}': {reason}")]
    Reasoning { node: String, reason: String },

    #[error("Node '{0}' has stopped")]
    Stopped(String),

    #[error("Node task for '{0}' panicked")]
    Panicked(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON payload: {0}")]
    MalformedJson(String),

    #[error("Failed to encode outbound message: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiring_error_displays_kind_and_alias() {
        let err = Error::Wiring(WiringError::DuplicateAlias {
            kind: EventKind::EndCall,
            existing: "call.end".into(),
        });
        assert!(err.to_string().contains("end_call"));
        assert!(err.to_string().contains("call.end"));
    }

    #[test]
    fn node_error_displays_correctly() {
        let err = Error::Node(NodeError::Reasoning {
            node: "support".into(),
            reason: "model timed out".into(),
        });
        assert!(err.to_string().contains("support"));
        assert!(err.to_string().contains("model timed out"));
    }

    #[test]
    fn transport_error_converts() {
        let err: Error = TransportError::Disconnected.into();
        assert!(matches!(err, Error::Transport(TransportError::Disconnected)));
    }
}
