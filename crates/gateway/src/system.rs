//! Per-call wiring of harness, bus and nodes.
//!
//! An [`AgentSystem`] is created for every connection. Call handlers add
//! bridges to it, optionally register observability aliases, then `start`
//! it. From that point:
//!
//! - a dispatch task pulls decoded input from the harness and publishes the
//!   resulting events on the bus
//! - every bridge reacts to bus events inside its own node task
//! - an outbound forwarder turns selected bus events into transport messages

use async_trait::async_trait;
use parley_agent::{Bridge, Node, NodeHandle, RunningBridge};
use parley_config::AppConfig;
use parley_core::{
    Bus, CallState, Event, EventFilter, EventHandler, EventKind, EventRegistry, Message, NodeError,
    NodeId, SubscriptionId, WiringError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::harness::{ConversationHarness, HarnessSettings};
use crate::transport::{TransportSink, TransportSource};

/// Bus identity used for events decoded from the transport.
pub const HARNESS_NODE_ID: &str = "harness";

/// Call-level tuning, normally derived from [`AppConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SystemSettings {
    pub harness: HarnessSettings,
    /// Grace period for transfers that do not specify one.
    pub transfer_timeout: Duration,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SystemSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            harness: HarnessSettings::from(&config.harness),
            transfer_timeout: Duration::from_secs(config.agent.transfer_timeout_secs),
        }
    }
}

type Starter = Box<dyn FnOnce(&Bus) -> parley_core::Result<RunningBridge> + Send>;
type Recorder = Box<dyn Fn(Event) -> Result<(), NodeError> + Send + Sync>;

struct SpeakingNode {
    id: NodeId,
    record: Recorder,
}

pub struct AgentSystem {
    bus: Bus,
    harness: Arc<ConversationHarness>,
    registry: EventRegistry,
    call_state: Arc<CallState>,
    settings: SystemSettings,
    speaking: Option<SpeakingNode>,
    node_ids: Vec<NodeId>,
    /// Drained once by `start`; behind a mutex so the system stays `Sync`.
    pending: Mutex<Vec<Starter>>,
    running: Vec<RunningBridge>,
    forwarder: Option<SubscriptionId>,
    dispatch: Option<JoinHandle<()>>,
    started: bool,
}

impl AgentSystem {
    pub fn new(
        source: impl TransportSource,
        sink: impl TransportSink,
        settings: SystemSettings,
        call_id: impl Into<String>,
    ) -> Self {
        let harness = ConversationHarness::new(Box::new(source), Box::new(sink), settings.harness);
        Self {
            bus: Bus::new(),
            harness: Arc::new(harness),
            registry: EventRegistry::new(),
            call_state: Arc::new(CallState::new(call_id)),
            settings,
            speaking: None,
            node_ids: Vec::new(),
            pending: Mutex::new(Vec::new()),
            running: Vec::new(),
            forwarder: None,
            dispatch: None,
            started: false,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn harness(&self) -> &Arc<ConversationHarness> {
        &self.harness
    }

    /// Flags shared by every node of this call.
    pub fn call_state(&self) -> Arc<CallState> {
        self.call_state.clone()
    }

    /// Add the node whose responses are spoken to the caller.
    pub fn with_speaking_node<N: Node>(
        &mut self,
        bridge: Bridge<N>,
    ) -> parley_core::Result<NodeHandle<N>> {
        if let Some(existing) = &self.speaking {
            return Err(WiringError::SpeakingNodeTaken(existing.id.to_string()).into());
        }
        let handle = self.with_node(bridge)?;
        let recorder = handle.clone();
        self.speaking = Some(SpeakingNode {
            id: handle.node_id().clone(),
            record: Box::new(move |event| recorder.record(event)),
        });
        Ok(handle)
    }

    /// Add a background node. Its output reaches the caller only through the
    /// kinds every node may forward (end call, transfer, errors, DTMF, metrics).
    pub fn with_node<N: Node>(&mut self, bridge: Bridge<N>) -> parley_core::Result<NodeHandle<N>> {
        if self.started {
            return Err(WiringError::AlreadyStarted.into());
        }
        let node_id = bridge.node_id().clone();
        if self.node_ids.contains(&node_id) || node_id.as_str() == HARNESS_NODE_ID {
            return Err(WiringError::DuplicateNode(node_id.to_string()).into());
        }
        let handle = bridge.handle();
        self.node_ids.push(node_id);
        self.pending
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(move |bus: &Bus| bridge.start(bus)));
        Ok(handle)
    }

    /// Report every event of `kind` to the transport as `log_event{alias}`.
    pub fn register_observability_event(
        &mut self,
        kind: EventKind,
        alias: impl Into<String>,
    ) -> parley_core::Result<()> {
        if self.started {
            return Err(WiringError::AlreadyStarted.into());
        }
        self.registry.register(alias, kind)?;
        Ok(())
    }

    /// Subscribe the forwarder, start every bridge, then begin reading input.
    pub fn start(&mut self) -> parley_core::Result<()> {
        if self.started {
            return Err(WiringError::AlreadyStarted.into());
        }
        self.started = true;

        let mut kinds = vec![
            EventKind::AgentResponse,
            EventKind::ToolResult,
            EventKind::EndCall,
            EventKind::TransferCall,
            EventKind::AgentError,
            EventKind::DtmfOutput,
            EventKind::LogMetric,
        ];
        kinds.extend(self.registry.kinds().cloned());

        let forwarder = OutboundForwarder {
            harness: self.harness.clone(),
            speaking: self.speaking.as_ref().map(|s| s.id.clone()),
            registry: self.registry.clone(),
            call_state: self.call_state.clone(),
            transfer_timeout: self.settings.transfer_timeout,
        };
        self.forwarder = Some(self.bus.subscribe(
            "outbound",
            EventFilter::kinds(kinds),
            forwarder,
        )?);

        let pending = std::mem::take(self.pending.get_mut().unwrap_or_else(|e| e.into_inner()));
        for start in pending {
            self.running.push(start(&self.bus)?);
        }

        self.harness.start();
        self.dispatch = Some(tokio::spawn(dispatch_loop(
            self.harness.clone(),
            self.bus.clone(),
        )));

        info!(
            call_id = %self.call_state.call_id,
            nodes = self.running.len(),
            "Agent system started"
        );
        Ok(())
    }

    /// Greet the caller. An empty message leaves the floor to the caller.
    pub async fn send_initial_message(&self, message: &str) {
        if message.is_empty() {
            info!("No introduction configured, waiting for the user to speak");
            return;
        }
        self.harness.send_message(message).await;
        match &self.speaking {
            Some(speaking) => {
                if let Err(e) = (speaking.record)(Event::agent_response(message)) {
                    warn!(node = %speaking.id, error = %e, "Could not record introduction");
                }
            }
            None => debug!("No speaking node, introduction not recorded"),
        }
    }

    pub async fn wait_for_shutdown(&self) {
        self.harness.wait_for_shutdown().await;
    }

    /// Tear the call down: stop input, cancel in-flight generation, close the bus.
    pub async fn cleanup(&mut self) {
        info!(call_id = %self.call_state.call_id, "Cleaning up agent system");
        self.harness.cleanup().await;

        if let Some(dispatch) = self.dispatch.take() {
            if let Err(e) = dispatch.await {
                error!(error = %e, "Dispatch task ended abnormally");
            }
        }

        for bridge in self.running.drain(..) {
            bridge.stop().await;
        }

        if let Some(id) = self.forwarder.take() {
            if let Err(e) = self.bus.unsubscribe(id) {
                debug!(error = %e, "Outbound forwarder already gone");
            }
        }
        self.bus.close();
        info!(call_id = %self.call_state.call_id, "Agent system cleanup completed");
    }
}

async fn dispatch_loop(harness: Arc<ConversationHarness>, bus: Bus) {
    let source = NodeId::from(HARNESS_NODE_ID);
    while let Some(input) = harness.next_input().await {
        for event in input.to_events() {
            if let Err(e) = bus.publish(&source, event) {
                debug!(error = %e, "Bus closed, stopping dispatch");
                return;
            }
        }
    }
    debug!("Dispatch loop stopped");
}

/// Turns bus events into transport messages.
struct OutboundForwarder {
    harness: Arc<ConversationHarness>,
    speaking: Option<NodeId>,
    registry: EventRegistry,
    call_state: Arc<CallState>,
    transfer_timeout: Duration,
}

impl OutboundForwarder {
    fn from_speaker(&self, message: &Message) -> bool {
        self.speaking.as_ref() == Some(&message.source)
    }
}

#[async_trait]
impl EventHandler for OutboundForwarder {
    async fn handle(&self, message: Message) -> parley_core::Result<()> {
        match message.event() {
            Event::AgentResponse { content, .. } if self.from_speaker(&message) => {
                self.harness.send_message(content).await;
            }
            Event::ToolResult(result) if self.from_speaker(&message) => {
                self.harness
                    .send_tool_call(
                        &result.tool_name,
                        result.tool_args.clone(),
                        result.tool_call_id.clone(),
                        result.result_str(),
                    )
                    .await;
            }
            Event::EndCall => self.harness.end_call().await,
            Event::TransferCall {
                target_phone_number,
                timeout_secs,
            } if self.call_state.mark_transferred() => {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.transfer_timeout);
                self.harness
                    .transfer_call(target_phone_number, timeout)
                    .await;
            }
            Event::TransferCall {
                target_phone_number,
                ..
            } => {
                warn!(target = %target_phone_number, "Call already transferred, ignoring transfer");
            }
            Event::AgentError { error, .. } => self.harness.send_error(error).await,
            Event::DtmfOutput { button } => self.harness.send_dtmf(button).await,
            Event::LogMetric { name, value } => {
                self.harness.log_metric(name, value.clone()).await;
            }
            _ => {}
        }

        if let Some(alias) = self.registry.get(&message.kind()) {
            let fields = message.event().fields();
            let metadata = (!fields.is_empty()).then_some(fields);
            self.harness.log_event(alias, metadata).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutputMessage;
    use crate::transport::memory::{self, MemoryPeer};
    use parley_agent::{ConversationHistory, EventStream};
    use serde_json::json;

    struct TestNode {
        id: NodeId,
        history: ConversationHistory,
    }

    impl TestNode {
        fn new(id: &str) -> Self {
            Self {
                id: NodeId::from(id),
                history: ConversationHistory::new(),
            }
        }
    }

    impl Node for TestNode {
        fn id(&self) -> &NodeId {
            &self.id
        }

        fn history(&self) -> &ConversationHistory {
            &self.history
        }

        fn history_mut(&mut self) -> &mut ConversationHistory {
            &mut self.history
        }

        fn generate(&mut self, _trigger: Message) -> EventStream<'_> {
            Box::pin(futures::stream::empty())
        }
    }

    fn system() -> (AgentSystem, MemoryPeer) {
        let (source, sink, peer) = memory::pair();
        let system = AgentSystem::new(source, sink, SystemSettings::default(), "call-test");
        (system, peer)
    }

    /// Speaker echoes transcripts; a background node reacts to DTMF with
    /// events of every forwardable kind.
    fn wire(system: &mut AgentSystem) -> NodeHandle<TestNode> {
        let mut speaker = Bridge::new(TestNode::new("speaker"));
        speaker
            .on(EventKind::UserTranscriptionReceived)
            .map(|node: &mut TestNode, message: &Message| {
                node.add_event(message.event().clone());
                let heard = message.event().content().unwrap_or_default();
                Event::agent_response(format!("You said: {heard}"))
            })
            .broadcast();
        let handle = system.with_speaking_node(speaker).unwrap();

        let mut monitor = Bridge::new(TestNode::new("monitor"));
        monitor
            .on(EventKind::DtmfInput)
            .map(|_: &mut TestNode, _: &Message| {
                vec![
                    Event::agent_response("background text is not spoken"),
                    Event::DtmfOutput { button: "#".into() },
                    Event::LogMetric {
                        name: "keypress".into(),
                        value: json!(1),
                    },
                    Event::error("something went wrong"),
                ]
            })
            .broadcast();
        system.with_node(monitor).unwrap();
        handle
    }

    #[tokio::test]
    async fn speaking_node_responses_reach_the_caller() {
        let (mut system, mut peer) = system();
        let handle = wire(&mut system);
        system.start().unwrap();

        peer.send_json(json!({"type": "message", "content": "hello"}));
        assert_eq!(
            peer.recv().await,
            Some(OutputMessage::Message {
                content: "You said: hello".into()
            })
        );

        let history = handle.with_node(|n| n.history().events().to_vec()).await.unwrap();
        assert_eq!(history, vec![Event::user_transcript("hello")]);
        system.cleanup().await;
    }

    #[tokio::test]
    async fn background_nodes_forward_only_shared_kinds() {
        let (mut system, mut peer) = system();
        wire(&mut system);
        system.start().unwrap();

        peer.send_json(json!({"type": "dtmf", "button": "5"}));
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(peer.recv().await.unwrap());
        }
        assert_eq!(
            received,
            vec![
                OutputMessage::Dtmf { button: "#".into() },
                OutputMessage::LogMetric {
                    name: "keypress".into(),
                    value: json!(1)
                },
                OutputMessage::Error {
                    content: "something went wrong".into()
                },
            ]
        );
        system.cleanup().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn unmatched_custom_input_is_inert() {
        let (mut system, mut peer) = system();
        wire(&mut system);
        system.start().unwrap();

        peer.send_json(json!({"type": "custom", "metadata": {"k": "v"}}));
        peer.send_json(json!({"type": "message", "content": "after"}));
        assert_eq!(
            peer.recv().await,
            Some(OutputMessage::Message {
                content: "You said: after".into()
            })
        );
        assert!(!system.harness().is_shutdown());
        system.cleanup().await;
    }

    #[tokio::test]
    async fn registered_alias_is_logged() {
        let (mut system, mut peer) = system();
        let mut monitor = Bridge::new(TestNode::new("monitor"));
        monitor
            .on(EventKind::UserTranscriptionReceived)
            .map(|_: &mut TestNode, _: &Message| Event::custom("escalation", json!({"level": 2})))
            .broadcast();
        system.with_node(monitor).unwrap();
        system
            .register_observability_event(EventKind::custom("escalation"), "escalation.alert")
            .unwrap();
        system.start().unwrap();

        peer.send_json(json!({"type": "message", "content": "manager please"}));
        match peer.recv().await {
            Some(OutputMessage::LogEvent { event, metadata }) => {
                assert_eq!(event, "escalation.alert");
                let metadata = metadata.unwrap();
                assert_eq!(metadata["name"], "escalation");
                assert_eq!(metadata["payload"]["level"], 2);
            }
            other => panic!("Expected log_event, got {other:?}"),
        }
        system.cleanup().await;
    }

    #[tokio::test]
    async fn end_call_from_any_node_shuts_down() {
        let (mut system, mut peer) = system();
        let mut closer = Bridge::new(TestNode::new("closer"));
        closer
            .on(EventKind::UserTranscriptionReceived)
            .map(|_: &mut TestNode, _: &Message| Event::EndCall)
            .broadcast();
        system.with_node(closer).unwrap();
        system.start().unwrap();

        peer.send_json(json!({"type": "message", "content": "bye"}));
        assert_eq!(peer.recv().await, Some(OutputMessage::EndCall));
        system.wait_for_shutdown().await;
        system.cleanup().await;
    }

    #[tokio::test]
    async fn only_the_first_transfer_is_forwarded() {
        let (mut system, mut peer) = system();
        let mut router = Bridge::new(TestNode::new("router"));
        router
            .on(EventKind::UserTranscriptionReceived)
            .map(|_: &mut TestNode, message: &Message| {
                Event::transfer(message.event().content().unwrap_or_default(), Some(60))
            })
            .broadcast();
        system.with_node(router).unwrap();
        system.start().unwrap();

        peer.send_json(json!({"type": "message", "content": "+15550100"}));
        assert_eq!(
            peer.recv().await,
            Some(OutputMessage::Transfer {
                target_phone_number: "+15550100".into()
            })
        );
        peer.send_json(json!({"type": "message", "content": "+15550199"}));
        assert_eq!(peer.recv_timeout(Duration::from_millis(200)).await, None);
        assert!(system.call_state().is_transferred());
        system.cleanup().await;
    }

    #[test]
    fn system_can_be_held_across_awaits() {
        fn shareable<T: Send + Sync>() {}
        shareable::<AgentSystem>();
    }

    #[tokio::test]
    async fn introduction_is_sent_and_recorded() {
        let (mut system, mut peer) = system();
        let handle = wire(&mut system);
        system.start().unwrap();

        system.send_initial_message("Hi, this is parley.").await;
        system.send_initial_message("").await;
        assert_eq!(
            peer.drain(),
            vec![OutputMessage::Message {
                content: "Hi, this is parley.".into()
            }]
        );
        let history = handle.with_node(|n| n.history().events().to_vec()).await.unwrap();
        assert_eq!(history, vec![Event::agent_response("Hi, this is parley.")]);
        system.cleanup().await;
    }

    #[tokio::test]
    async fn wiring_mistakes_are_rejected() {
        let (mut system, _peer) = system();
        system.with_speaking_node(Bridge::new(TestNode::new("a"))).unwrap();
        assert!(matches!(
            system.with_speaking_node(Bridge::new(TestNode::new("b"))),
            Err(parley_core::Error::Wiring(WiringError::SpeakingNodeTaken(_)))
        ));
        assert!(matches!(
            system.with_node(Bridge::new(TestNode::new("a"))),
            Err(parley_core::Error::Wiring(WiringError::DuplicateNode(_)))
        ));
        system
            .register_observability_event(EventKind::EndCall, "call.end")
            .unwrap();
        assert!(matches!(
            system.register_observability_event(EventKind::EndCall, "call.finished"),
            Err(parley_core::Error::Wiring(WiringError::DuplicateAlias { .. }))
        ));
    }
}
