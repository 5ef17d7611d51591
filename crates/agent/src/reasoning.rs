//! Reasoning nodes.
//!
//! [`ReasoningNode`] implements the shared generation flow once: check for
//! history, build a bounded [`ConversationContext`], run the pluggable
//! [`Reasoner`], store every output event, and close the turn with an
//! `AgentGenerationComplete` marker. Concrete agents only implement
//! [`Reasoner::process_context`].

use async_stream::stream;
use futures::StreamExt;
use parley_core::{Event, Message, NodeId};
use tracing::{debug, error, info};

use crate::context::{
    ConversationContext, META_MAX_CONTEXT_LENGTH, META_TOTAL_MESSAGES, META_VISIBLE_MESSAGES,
};
use crate::history::ConversationHistory;
use crate::node::{EventStream, Node, ReasoningStream};

/// Default number of history events visible to reasoning.
pub const DEFAULT_MAX_CONTEXT_LENGTH: usize = 100;

/// Said to the user when reasoning fails mid-turn.
pub const FALLBACK_RESPONSE: &str =
    "I'm sorry, I ran into a problem while thinking about that. Could you say it again?";

/// Agent-specific reasoning.
///
/// Implementations must terminate, must only yield agent responses, tool
/// calls, tool results or application events, and receive the context by
/// value so they cannot alter the node's history.
pub trait Reasoner: Send + 'static {
    fn process_context<'a>(&'a mut self, context: ConversationContext) -> ReasoningStream<'a>;
}

pub struct ReasoningNode<R> {
    id: NodeId,
    system_prompt: String,
    max_context_length: usize,
    history: ConversationHistory,
    reasoner: R,
}

impl<R: Reasoner> ReasoningNode<R> {
    pub fn new(system_prompt: impl Into<String>, reasoner: R) -> Self {
        let node = Self {
            id: NodeId::new(),
            system_prompt: system_prompt.into(),
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            history: ConversationHistory::new(),
            reasoner,
        };
        info!(node = %node.id, "Reasoning node initialized");
        node
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the context window. Values below 1 are raised to 1.
    pub fn with_max_context_length(mut self, max: usize) -> Self {
        self.max_context_length = max.max(1);
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    pub fn reasoner_mut(&mut self) -> &mut R {
        &mut self.reasoner
    }

    /// Snapshot of the most recent `max_context_length` events.
    pub fn build_context(&self) -> ConversationContext {
        let visible = self.history.tail(self.max_context_length).to_vec();
        let visible_count = visible.len();
        ConversationContext::new(visible, self.system_prompt.clone())
            .with_metadata(META_MAX_CONTEXT_LENGTH, self.max_context_length)
            .with_metadata(META_TOTAL_MESSAGES, self.history.len())
            .with_metadata(META_VISIBLE_MESSAGES, visible_count)
    }
}

impl<R: Reasoner> Node for ReasoningNode<R> {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn history(&self) -> &ConversationHistory {
        &self.history
    }

    fn history_mut(&mut self) -> &mut ConversationHistory {
        &mut self.history
    }

    fn generate(&mut self, trigger: Message) -> EventStream<'_> {
        if self.history.is_empty() {
            debug!(node = %self.id, seq = trigger.id, "No history yet, skipping generation");
            return futures::stream::empty().boxed();
        }

        let context = self.build_context();
        debug!(
            node = %self.id,
            seq = trigger.id,
            visible = context.event_count(),
            "Processing context"
        );

        let Self {
            id,
            history,
            reasoner,
            ..
        } = self;

        Box::pin(stream! {
            let mut output = reasoner.process_context(context);
            while let Some(item) = output.next().await {
                match item {
                    Ok(event) => {
                        history.push(event.clone());
                        yield event;
                    }
                    Err(e) => {
                        error!(node = %id, error = %e, "Reasoning failed");
                        let fallback = Event::agent_response(FALLBACK_RESPONSE);
                        history.push(fallback.clone());
                        yield fallback;
                        break;
                    }
                }
            }
            yield Event::AgentGenerationComplete;
        })
    }
}
