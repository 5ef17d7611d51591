//! Per-call data: the bootstrap request and shared call state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Agent block of a call-creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
}

/// Everything known about a call when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub call_id: String,

    #[serde(alias = "from_")]
    pub from: String,
    pub to: String,
    pub agent_call_id: String,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CallRequest {
    pub fn new(call_id: impl Into<String>) -> Self {
        let call_id = call_id.into();
        Self {
            agent_call_id: call_id.clone(),
            call_id,
            from: "unknown".into(),
            to: "unknown".into(),
            agent: AgentConfig::default(),
            metadata: serde_json::Map::new(),
        }
    }

    /// System prompt from the request, or `fallback` when none was supplied.
    pub fn system_prompt_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.agent
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(fallback)
    }

    /// Opening line for the call. An explicitly empty introduction is kept,
    /// which means the agent waits for the caller to speak first.
    pub fn introduction_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.agent.introduction.as_deref().unwrap_or(fallback)
    }
}

/// Result of a pre-call hook: metadata merged into the request and an
/// optional config block echoed back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreCallResult {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Flags shared by the nodes of one call.
///
/// Share it with `Arc`. Each flag is written by a single rule by convention;
/// atomics keep reads cheap from any task.
#[derive(Debug)]
pub struct CallState {
    pub call_id: String,
    escalated: AtomicBool,
    transferred: AtomicBool,
}

impl CallState {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            escalated: AtomicBool::new(false),
            transferred: AtomicBool::new(false),
        }
    }

    /// Set the escalation flag. Returns `true` only for the call that set it.
    pub fn mark_escalated(&self) -> bool {
        !self.escalated.swap(true, Ordering::SeqCst)
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }

    /// Set the transfer flag. Returns `true` only for the call that set it.
    pub fn mark_transferred(&self) -> bool {
        !self.transferred.swap(true, Ordering::SeqCst)
    }

    pub fn is_transferred(&self) -> bool {
        self.transferred.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let req = CallRequest::new("call-1");
        assert_eq!(req.agent_call_id, "call-1");
        assert_eq!(req.from, "unknown");
        assert_eq!(req.system_prompt_or("default"), "default");
        assert_eq!(req.introduction_or("Hi"), "Hi");
    }

    #[test]
    fn empty_introduction_is_respected() {
        let mut req = CallRequest::new("call-1");
        req.agent.introduction = Some(String::new());
        assert_eq!(req.introduction_or("Hi"), "");
    }

    #[test]
    fn request_deserializes_agent_block() {
        let req: CallRequest = serde_json::from_value(serde_json::json!({
            "call_id": "c",
            "from": "+15550001",
            "to": "+15550002",
            "agent_call_id": "a",
            "agent": {"system_prompt": "Be brief."},
        }))
        .unwrap();
        assert_eq!(req.system_prompt_or("default"), "Be brief.");
        assert!(req.agent.introduction.is_none());
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn escalation_flag_flips_once() {
        let state = CallState::new("c");
        assert!(!state.is_escalated());
        assert!(state.mark_escalated());
        assert!(!state.mark_escalated());
        assert!(state.is_escalated());
        assert!(!state.is_transferred());
    }
}
