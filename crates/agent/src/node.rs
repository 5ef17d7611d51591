//! The node abstraction.
//!
//! A node is a stateful conversation participant. It owns its history, and
//! only the task driving the node ever touches it: bridges move the node into
//! a dedicated task and hand it out by `&mut` one invocation at a time.

use futures::stream::BoxStream;
use parley_core::{Event, Message, NodeError, NodeId};
use tracing::info;

use crate::history::ConversationHistory;

/// Lazy sequence of output events borrowed from a node.
pub type EventStream<'a> = BoxStream<'a, Event>;

/// Output of reasoning logic; an `Err` ends the generation cycle.
pub type ReasoningStream<'a> = BoxStream<'a, Result<Event, NodeError>>;

pub trait Node: Send + 'static {
    fn id(&self) -> &NodeId;

    fn history(&self) -> &ConversationHistory;

    fn history_mut(&mut self) -> &mut ConversationHistory;

    /// Record an event in this node's history, merging textual fragments.
    fn add_event(&mut self, event: Event) {
        self.history_mut().push(event);
    }

    /// Empty the history and return every event it held.
    fn clear_context(&mut self) -> Vec<Event> {
        let cleared = self.history_mut().take();
        tracing::debug!(node = %self.id(), cleared = cleared.len(), "Cleared conversation context");
        cleared
    }

    /// Called after this node's active generation was cancelled.
    fn on_interrupt(&mut self, message: &Message) {
        info!(
            node = %self.id(),
            interrupt = %message.kind(),
            seq = message.id,
            "Generation interrupted"
        );
    }

    /// Produce output events in response to `trigger`.
    ///
    /// The stream is polled by the bridge and dropped at its next suspension
    /// point when the route is interrupted.
    fn generate(&mut self, trigger: Message) -> EventStream<'_>;
}
