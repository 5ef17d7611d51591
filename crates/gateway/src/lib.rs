//! Transport-facing side of parley.
//!
//! Translates a bidirectional text-frame stream into bus events and back,
//! wires one [`AgentSystem`] per call, and serves the HTTP endpoints that
//! create and host calls.
//!
//! Built on Axum; any other transport can be plugged in through
//! [`TransportSource`] and [`TransportSink`].

pub mod app;
pub mod harness;
pub mod protocol;
pub mod system;
pub mod transport;

pub use app::{AppState, CallHandler, PreCallHandler, build_router, run_call, start};
pub use harness::{ConversationHarness, HarnessSettings};
pub use protocol::{ActivityState, InputMessage, OutputMessage};
pub use system::{AgentSystem, HARNESS_NODE_ID, SystemSettings};
pub use transport::{TransportSink, TransportSource};
