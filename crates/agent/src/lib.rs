//! Nodes and routing for parley.
//!
//! A conversation is driven by **nodes** that react to bus events:
//!
//! 1. **Record** incoming events into the node's private history
//! 2. **Build context** from the most recent slice of that history
//! 3. **Reason** over the context, streaming output events
//! 4. **Broadcast** the output so other nodes and the transport see it
//!
//! [`Bridge`] wires these steps to event kinds and cancels in-flight
//! generation when an interrupting event (usually the user starting to
//! speak) arrives.

pub mod bridge;
pub mod context;
pub mod history;
pub mod node;
pub mod reasoning;

pub use bridge::{Bridge, BusyPolicy, IntoEvents, NodeHandle, RouteBuilder, RunningBridge};
pub use context::ConversationContext;
pub use history::ConversationHistory;
pub use node::{EventStream, Node, ReasoningStream};
pub use reasoning::{DEFAULT_MAX_CONTEXT_LENGTH, FALLBACK_RESPONSE, Reasoner, ReasoningNode};
