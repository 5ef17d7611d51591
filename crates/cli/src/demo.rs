//! Demo agent served by `parley serve`.
//!
//! Two nodes per call:
//! - a speaking node that echoes the caller back one word at a time and
//!   hangs up when the caller says goodbye
//! - a background monitor that watches transcripts for escalation keywords
//!   and raises one `escalation` event per call

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use parley_agent::{
    Bridge, ConversationContext, ConversationHistory, EventStream, Node, ReasoningNode,
    ReasoningStream, Reasoner,
};
use parley_config::AppConfig;
use parley_core::{CallRequest, CallState, Event, EventKind, Message, NodeId};
use parley_gateway::{AgentSystem, CallHandler};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub const ESCALATION_EVENT: &str = "escalation";
pub const ESCALATION_ALIAS: &str = "escalation.detected";

const ESCALATION_KEYWORDS: &[&str] = &["manager", "supervisor", "human", "representative"];
const FAREWELLS: &[&str] = &["goodbye", "bye", "hang up"];

/// Repeats the latest transcript.
#[derive(Default)]
pub struct EchoReasoner;

impl Reasoner for EchoReasoner {
    fn process_context<'a>(&'a mut self, context: ConversationContext) -> ReasoningStream<'a> {
        let heard = context
            .latest_user_transcript()
            .unwrap_or_default()
            .trim()
            .to_string();
        let lowered = heard.to_lowercase();
        let farewell = FAREWELLS.iter().any(|w| lowered.contains(w));

        stream! {
            if heard.is_empty() {
                return;
            }
            if farewell {
                yield Ok(Event::agent_response("Thanks for calling. Goodbye!"));
                yield Ok(Event::EndCall);
                return;
            }
            yield Ok(Event::agent_response("You said: "));
            for word in heard.split_inclusive(' ') {
                yield Ok(Event::agent_response(word));
            }
        }
        .boxed()
    }
}

/// Flags the call for escalation the first time a keyword is heard.
pub struct EscalationMonitor {
    id: NodeId,
    history: ConversationHistory,
    call_state: Arc<CallState>,
}

impl EscalationMonitor {
    pub fn new(call_state: Arc<CallState>) -> Self {
        Self {
            id: NodeId::from("escalation-monitor"),
            history: ConversationHistory::new(),
            call_state,
        }
    }
}

impl Node for EscalationMonitor {
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
        let text = trigger.event().content().unwrap_or_default().to_lowercase();
        let keyword = ESCALATION_KEYWORDS.iter().find(|k| text.contains(*k));

        let event = match keyword {
            Some(keyword) if self.call_state.mark_escalated() => {
                info!(call_id = %self.call_state.call_id, keyword, "Escalation requested");
                Some(Event::custom(ESCALATION_EVENT, json!({ "keyword": keyword })))
            }
            _ => None,
        };
        futures::stream::iter(event).boxed()
    }
}

/// Wires the demo nodes for every call.
pub struct DemoCallHandler {
    system_prompt: String,
    introduction: String,
    max_context_length: usize,
}

impl DemoCallHandler {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            system_prompt: config.agent.system_prompt.clone(),
            introduction: config.agent.introduction.clone(),
            max_context_length: config.agent.max_context_length,
        }
    }

    /// Add both nodes to `system` without starting it.
    pub fn wire(&self, system: &mut AgentSystem, request: &CallRequest) -> parley_core::Result<()> {
        let speaker = ReasoningNode::new(request.system_prompt_or(&self.system_prompt), EchoReasoner)
            .with_id("speaker")
            .with_max_context_length(self.max_context_length);

        let mut bridge = Bridge::new(speaker);
        bridge.on(EventKind::UserTranscriptionReceived).record();
        bridge.on(EventKind::AgentSpeechSent).record();
        bridge
            .on(EventKind::UserStoppedSpeaking)
            .interrupt_on(EventKind::UserStartedSpeaking, |_: &mut _, _: &Message| ())
            .generate()
            .broadcast();
        system.with_speaking_node(bridge)?;

        let mut monitor = Bridge::new(EscalationMonitor::new(system.call_state()));
        monitor
            .on(EventKind::UserTranscriptionReceived)
            .record()
            .generate()
            .broadcast();
        system.with_node(monitor)?;

        system.register_observability_event(EventKind::custom(ESCALATION_EVENT), ESCALATION_ALIAS)?;
        Ok(())
    }
}

#[async_trait]
impl CallHandler for DemoCallHandler {
    async fn handle_call(
        &self,
        system: &mut AgentSystem,
        request: CallRequest,
    ) -> parley_core::Result<()> {
        info!(
            call_id = %request.call_id,
            from = %request.from,
            to = %request.to,
            "Starting demo call"
        );
        self.wire(system, &request)?;
        system.start()?;
        system
            .send_initial_message(request.introduction_or(&self.introduction))
            .await;
        system.wait_for_shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_gateway::protocol::OutputMessage;
    use parley_gateway::transport::memory;
    use parley_gateway::{SystemSettings, run_call};

    #[tokio::test]
    async fn echo_streams_words_and_says_goodbye() {
        let mut reasoner = EchoReasoner;
        let context = ConversationContext::new(vec![Event::user_transcript("hi there")], "");
        let out: Vec<_> = reasoner.process_context(context).collect().await;
        let out: Vec<Event> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            out,
            vec![
                Event::agent_response("You said: "),
                Event::agent_response("hi "),
                Event::agent_response("there"),
            ]
        );

        let context = ConversationContext::new(vec![Event::user_transcript("OK bye")], "");
        let out: Vec<_> = reasoner.process_context(context).collect().await;
        assert!(matches!(out.last(), Some(Ok(Event::EndCall))));
    }

    #[tokio::test]
    async fn monitor_escalates_once() {
        let state = Arc::new(CallState::new("c"));
        let mut monitor = EscalationMonitor::new(state.clone());
        let trigger =
            |text: &str| Message::new(1, NodeId::from("harness"), Event::user_transcript(text));

        let quiet: Vec<_> = monitor.generate(trigger("just browsing")).collect().await;
        assert!(quiet.is_empty());

        let first: Vec<_> = monitor.generate(trigger("get me a Manager")).collect().await;
        assert_eq!(first.len(), 1);
        assert!(state.is_escalated());

        let second: Vec<_> = monitor.generate(trigger("human please")).collect().await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn demo_call_greets_echoes_and_reports_escalation() {
        let config = AppConfig::default();
        let handler = DemoCallHandler::new(&config);
        let (source, sink, mut peer) = memory::pair();
        let system = AgentSystem::new(source, sink, SystemSettings::from(&config), "demo-1");

        let call = tokio::spawn(async move {
            run_call(system, &handler, CallRequest::new("demo-1")).await;
        });

        assert_eq!(
            peer.recv().await,
            Some(OutputMessage::Message {
                content: config.agent.introduction.clone()
            })
        );

        peer.send_json(json!({"type": "message", "content": "manager now"}));
        match peer.recv().await {
            Some(OutputMessage::LogEvent { event, .. }) => assert_eq!(event, ESCALATION_ALIAS),
            other => panic!("Expected escalation log_event, got {other:?}"),
        }

        peer.send_json(json!({"type": "user_state", "value": "idle"}));
        let mut spoken = String::new();
        while let Some(OutputMessage::Message { content }) = peer.recv().await {
            spoken.push_str(&content);
            if spoken.ends_with("now") {
                break;
            }
        }
        assert_eq!(spoken, "You said: manager now");

        peer.disconnect();
        call.await.unwrap();
    }

    #[tokio::test]
    async fn demo_handler_runs_as_shared_trait_object() {
        let config = AppConfig::default();
        let handler: Arc<dyn CallHandler> = Arc::new(DemoCallHandler::new(&config));
        let (source, sink, mut peer) = memory::pair();
        let system = AgentSystem::new(source, sink, SystemSettings::from(&config), "demo-2");

        let call = tokio::spawn(async move {
            run_call(system, handler.as_ref(), CallRequest::new("demo-2")).await;
        });

        assert!(matches!(peer.recv().await, Some(OutputMessage::Message { .. })));
        peer.send_json(json!({"type": "message", "content": "goodbye"}));
        peer.send_json(json!({"type": "user_state", "value": "idle"}));
        loop {
            match peer.recv().await {
                Some(OutputMessage::EndCall) => break,
                Some(_) => continue,
                None => panic!("Transport closed before end_call"),
            }
        }
        call.await.unwrap();
    }
}
