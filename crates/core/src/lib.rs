//! # Parley Core
//!
//! Event taxonomy, bus, and per-call types for the parley conversational
//! agent runtime. Everything else in the workspace depends inward on this
//! crate.
//!
//! ## Layout
//!
//! - [`event`]: the closed set of conversation events and their routing kinds
//! - [`bus`]: ordered in-process publish/subscribe
//! - [`registry`]: event aliases used for observability forwarding
//! - [`call`]: call bootstrap request and shared call state

pub mod bus;
pub mod call;
pub mod error;
pub mod event;
pub mod message;
pub mod registry;

// Re-export key types at crate root for ergonomics
pub use bus::{Bus, EventHandler, FnHandler, SubscriptionId, handler_fn};
pub use call::{AgentConfig, CallRequest, CallState, PreCallResult};
pub use error::{
    BusError, Error, NodeError, ProtocolError, Result, TransportError, WiringError,
};
pub use event::{
    DEFAULT_TRANSFER_TIMEOUT_SECS, Event, EventFilter, EventKind, ToolCall, ToolResult,
};
pub use message::{Message, NodeId};
pub use registry::EventRegistry;
