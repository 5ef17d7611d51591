//! Bridges: declarative routing from bus events to node behavior.
//!
//! A [`Bridge`] owns one node and a list of routes built with
//! [`Bridge::on`]. Each route names a trigger kind and a chain of stages:
//!
//! - `filter` drops triggers the predicate rejects
//! - `map` runs once per trigger, synchronously, and is never cancelled
//! - `stream` runs a long-lived, cancellable generation (usually `generate`)
//! - `interrupt_on` cancels the active stream when another kind arrives and
//!   runs a cleanup handler with the interrupting message
//! - `broadcast` republishes every produced event on the bus
//!
//! Once started, the node lives inside a single actor task. Bus events reach
//! it through a dispatcher subscription that only enqueues commands, so the
//! node's history has exactly one writer. Interrupts are handled in the
//! dispatcher itself: they cancel the active stream immediately and
//! invalidate triggers still waiting in the queue.
//!
//! ```ignore
//! let mut bridge = Bridge::new(node);
//! bridge.on(EventKind::UserTranscriptionReceived).record();
//! bridge
//!     .on(EventKind::UserStoppedSpeaking)
//!     .interrupt_on(EventKind::UserStartedSpeaking, |_, _| ())
//!     .generate()
//!     .broadcast();
//! let running = bridge.start(&bus)?;
//! ```

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parley_core::{
    Bus, Event, EventFilter, EventHandler, EventKind, Message, NodeError, NodeId, SubscriptionId,
    WiringError,
};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::node::{EventStream, Node};

/// What a route does with a trigger that arrives while its stream is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Run it after the active stream finishes.
    #[default]
    Queue,
    /// Log and discard it.
    Drop,
}

/// Values a `map` or interrupt handler may return.
pub trait IntoEvents {
    fn into_events(self) -> Vec<Event>;
}

impl IntoEvents for () {
    fn into_events(self) -> Vec<Event> {
        Vec::new()
    }
}

impl IntoEvents for Event {
    fn into_events(self) -> Vec<Event> {
        vec![self]
    }
}

impl IntoEvents for Option<Event> {
    fn into_events(self) -> Vec<Event> {
        self.into_iter().collect()
    }
}

impl IntoEvents for Vec<Event> {
    fn into_events(self) -> Vec<Event> {
        self
    }
}

type FilterFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
type MapFn<N> = Box<dyn Fn(&mut N, &Message) -> Vec<Event> + Send + Sync>;
type StreamFn<N> = Box<dyn for<'a> Fn(&'a mut N, Message) -> EventStream<'a> + Send + Sync>;
type InterruptFn<N> = Box<dyn Fn(&mut N, &Message) -> Vec<Event> + Send + Sync>;

struct Route<N> {
    trigger: EventKind,
    filter: Option<FilterFn>,
    map: Option<MapFn<N>>,
    stream: Option<StreamFn<N>>,
    interrupt: Option<(EventKind, InterruptFn<N>)>,
    broadcast: bool,
    busy: BusyPolicy,
}

impl<N> Route<N> {
    fn new(trigger: EventKind) -> Self {
        Self {
            trigger,
            filter: None,
            map: None,
            stream: None,
            interrupt: None,
            broadcast: false,
            busy: BusyPolicy::default(),
        }
    }

    fn validate(&self) -> Result<(), WiringError> {
        if self.map.is_none() && self.stream.is_none() {
            return Err(WiringError::EmptyRoute {
                trigger: self.trigger.clone(),
            });
        }
        if let Some((interrupt, _)) = &self.interrupt {
            if *interrupt == self.trigger {
                return Err(WiringError::SelfInterrupt {
                    trigger: self.trigger.clone(),
                });
            }
            if self.stream.is_none() {
                return Err(WiringError::InterruptWithoutStream {
                    trigger: self.trigger.clone(),
                    interrupt: interrupt.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Run state of one route, shared by the dispatcher and the actor.
#[derive(Default)]
struct Slot {
    /// Bumped by every interrupt; invocations carrying an older epoch are stale.
    epoch: u64,
    /// Invocations sent to the actor but not yet picked up.
    pending: usize,
    active: Option<CancellationToken>,
    interrupted_by: Option<Message>,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> std::sync::MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

enum Command<N> {
    Invoke {
        route: usize,
        message: Message,
        epoch: u64,
    },
    Exec(Box<dyn FnOnce(&mut N) + Send>),
}

/// A node plus its routing rules, before it is attached to a bus.
pub struct Bridge<N: Node> {
    node: N,
    routes: Vec<Route<N>>,
    errors: Vec<WiringError>,
    commands: mpsc::UnboundedSender<Command<N>>,
    receiver: mpsc::UnboundedReceiver<Command<N>>,
}

impl<N: Node> Bridge<N> {
    pub fn new(node: N) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        Self {
            node,
            routes: Vec::new(),
            errors: Vec::new(),
            commands,
            receiver,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut N {
        &mut self.node
    }

    /// Handle for running work inside the node's task. Commands sent before
    /// `start` run first, in order.
    pub fn handle(&self) -> NodeHandle<N> {
        NodeHandle {
            node_id: self.node.id().clone(),
            commands: self.commands.clone(),
        }
    }

    /// Begin a route triggered by `kind`.
    pub fn on(&mut self, kind: EventKind) -> RouteBuilder<'_, N> {
        self.routes.push(Route::new(kind));
        let index = self.routes.len() - 1;
        RouteBuilder {
            bridge: self,
            index,
        }
    }

    /// Validate the routes, move the node into its task and subscribe to `bus`.
    pub fn start(self, bus: &Bus) -> parley_core::Result<RunningBridge> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err.into());
        }
        for route in &self.routes {
            route.validate()?;
        }

        let node_id = self.node.id().clone();
        let slots: Vec<SharedSlot> = self.routes.iter().map(|_| SharedSlot::default()).collect();

        let mut kinds = Vec::new();
        let mut triggers = Vec::new();
        let mut interrupts = Vec::new();
        for (index, route) in self.routes.iter().enumerate() {
            kinds.push(route.trigger.clone());
            triggers.push(TriggerRule {
                route: index,
                kind: route.trigger.clone(),
                filter: route.filter.clone(),
                busy: route.busy,
                streams: route.stream.is_some(),
            });
            if let Some((kind, _)) = &route.interrupt {
                kinds.push(kind.clone());
                interrupts.push((index, kind.clone()));
            }
        }

        let dispatcher = Dispatcher {
            node_id: node_id.clone(),
            triggers,
            interrupts,
            slots: slots.clone(),
            commands: self.commands.clone(),
        };
        let subscription = bus
            .subscribe(
                format!("bridge:{node_id}"),
                EventFilter::kinds(kinds),
                dispatcher,
            )
            .inspect_err(|e| warn!(node = %node_id, error = %e, "Bridge could not subscribe"))?;

        let shutdown = CancellationToken::new();
        let actor = Actor {
            node: self.node,
            node_id: node_id.clone(),
            routes: self.routes,
            slots,
            bus: bus.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(actor.run(self.receiver));

        info!(node = %node_id, subscription, "Bridge started");
        Ok(RunningBridge {
            node_id,
            subscription,
            bus: bus.clone(),
            shutdown,
            task,
        })
    }
}

/// Chained configuration of one route.
pub struct RouteBuilder<'b, N: Node> {
    bridge: &'b mut Bridge<N>,
    index: usize,
}

impl<N: Node> RouteBuilder<'_, N> {
    fn route(&mut self) -> &mut Route<N> {
        &mut self.bridge.routes[self.index]
    }

    fn duplicate(&mut self, stage: &'static str) {
        let trigger = self.route().trigger.clone();
        self.bridge
            .errors
            .push(WiringError::DuplicateStage { trigger, stage });
    }

    /// Only fire when `predicate` accepts the trigger.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        if self.route().filter.is_some() {
            self.duplicate("filter");
        } else {
            self.route().filter = Some(Arc::new(predicate));
        }
        self
    }

    /// One-shot transform of the trigger into zero or more events.
    pub fn map<F, O>(mut self, f: F) -> Self
    where
        F: Fn(&mut N, &Message) -> O + Send + Sync + 'static,
        O: IntoEvents,
    {
        if self.route().map.is_some() {
            self.duplicate("map");
        } else {
            self.route().map = Some(Box::new(move |node: &mut N, message: &Message| {
                f(node, message).into_events()
            }));
        }
        self
    }

    /// Shorthand for a map stage that appends the trigger to the node's history.
    pub fn record(self) -> Self {
        self.map(|node: &mut N, message: &Message| node.add_event(message.event().clone()))
    }

    /// Cancel the active stream when `kind` arrives, then run `handler`.
    pub fn interrupt_on<F, O>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&mut N, &Message) -> O + Send + Sync + 'static,
        O: IntoEvents,
    {
        if self.route().interrupt.is_some() {
            self.duplicate("interrupt_on");
        } else {
            let handler: InterruptFn<N> = Box::new(move |node: &mut N, message: &Message| {
                handler(node, message).into_events()
            });
            self.route().interrupt = Some((kind, handler));
        }
        self
    }

    /// Bind a cancellable stream as the route's body.
    pub fn stream<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut N, Message) -> EventStream<'a> + Send + Sync + 'static,
    {
        if self.route().stream.is_some() {
            self.duplicate("stream");
        } else {
            self.route().stream = Some(Box::new(f));
        }
        self
    }

    /// Use the node's own `generate` as the stream stage.
    pub fn generate(self) -> Self {
        self.stream(N::generate)
    }

    /// Publish everything this route produces back onto the bus.
    pub fn broadcast(mut self) -> Self {
        self.route().broadcast = true;
        self
    }

    pub fn when_busy(mut self, policy: BusyPolicy) -> Self {
        self.route().busy = policy;
        self
    }
}

/// Runs closures against a node inside its owning task.
pub struct NodeHandle<N> {
    node_id: NodeId,
    commands: mpsc::UnboundedSender<Command<N>>,
}

impl<N> Clone for NodeHandle<N> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<N: Node> NodeHandle<N> {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn stopped(&self) -> NodeError {
        NodeError::Stopped(self.node_id.to_string())
    }

    /// Append an event to the node's history without waiting.
    pub fn record(&self, event: Event) -> Result<(), NodeError> {
        self.commands
            .send(Command::Exec(Box::new(move |node: &mut N| {
                node.add_event(event)
            })))
            .map_err(|_| self.stopped())
    }

    /// Run `f` with exclusive access to the node and return its result.
    pub async fn with_node<F, T>(&self, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(&mut N) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Exec(Box::new(move |node: &mut N| {
                let _ = tx.send(f(node));
            })))
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    pub async fn clear_context(&self) -> Result<Vec<Event>, NodeError> {
        self.with_node(|node| node.clear_context()).await
    }
}

/// A started bridge. Dropping it leaves the node running until the bus closes;
/// call [`RunningBridge::stop`] for an orderly shutdown.
pub struct RunningBridge {
    node_id: NodeId,
    subscription: SubscriptionId,
    bus: Bus,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningBridge {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unsubscribe, cancel any active stream and wait for the node task.
    pub async fn stop(self) {
        if let Err(e) = self.bus.unsubscribe(self.subscription) {
            debug!(node = %self.node_id, error = %e, "Bridge subscription already gone");
        }
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(node = %self.node_id, error = %e, "Node task ended abnormally");
        }
        debug!(node = %self.node_id, "Bridge stopped");
    }
}

struct TriggerRule {
    route: usize,
    kind: EventKind,
    filter: Option<FilterFn>,
    busy: BusyPolicy,
    streams: bool,
}

/// Bus-side half of a bridge: turns matching events into actor commands.
struct Dispatcher<N> {
    node_id: NodeId,
    triggers: Vec<TriggerRule>,
    interrupts: Vec<(usize, EventKind)>,
    slots: Vec<SharedSlot>,
    commands: mpsc::UnboundedSender<Command<N>>,
}

impl<N: Node> Dispatcher<N> {
    fn interrupt(&self, route: usize, message: &Message) {
        let mut slot = lock(&self.slots[route]);
        slot.epoch += 1;
        if let Some(token) = &slot.active {
            if !token.is_cancelled() {
                debug!(
                    node = %self.node_id,
                    route,
                    interrupt = %message.kind(),
                    seq = message.id,
                    "Cancelling active stream"
                );
                token.cancel();
                slot.interrupted_by = Some(message.clone());
            }
        } else if slot.pending > 0 {
            debug!(
                node = %self.node_id,
                route,
                superseded = slot.pending,
                "Interrupt supersedes queued triggers"
            );
        }
    }

    fn trigger(&self, rule: &TriggerRule, message: &Message) -> parley_core::Result<()> {
        if let Some(filter) = &rule.filter {
            if !filter(message) {
                debug!(node = %self.node_id, route = rule.route, seq = message.id, "Trigger filtered out");
                return Ok(());
            }
        }

        let epoch = {
            let mut slot = lock(&self.slots[rule.route]);
            let busy = slot.active.is_some() || slot.pending > 0;
            if rule.streams && busy && rule.busy == BusyPolicy::Drop {
                debug!(
                    node = %self.node_id,
                    route = rule.route,
                    seq = message.id,
                    "Route busy, dropping trigger"
                );
                return Ok(());
            }
            slot.pending += 1;
            slot.epoch
        };

        debug!(
            node = %self.node_id,
            route = rule.route,
            kind = %rule.kind,
            seq = message.id,
            "Dispatching trigger"
        );
        self.commands
            .send(Command::Invoke {
                route: rule.route,
                message: message.clone(),
                epoch,
            })
            .map_err(|_| NodeError::Stopped(self.node_id.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl<N: Node> EventHandler for Dispatcher<N> {
    async fn handle(&self, message: Message) -> parley_core::Result<()> {
        let kind = message.kind();

        // Interrupts first, so a kind that both interrupts one route and
        // triggers another never starts work that is cancelled straight away.
        for (route, interrupt) in &self.interrupts {
            if *interrupt == kind {
                self.interrupt(*route, &message);
            }
        }
        for rule in &self.triggers {
            if rule.kind == kind {
                self.trigger(rule, &message)?;
            }
        }
        Ok(())
    }
}

/// Node-side half of a bridge: the only task that touches the node.
struct Actor<N: Node> {
    node: N,
    node_id: NodeId,
    routes: Vec<Route<N>>,
    slots: Vec<SharedSlot>,
    bus: Bus,
    shutdown: CancellationToken,
}

impl<N: Node> Actor<N> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<N>>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Exec(f) => {
                    let node = &mut self.node;
                    if std::panic::catch_unwind(AssertUnwindSafe(move || f(node))).is_err() {
                        error!(node = %self.node_id, "Node command panicked");
                    }
                }
                Command::Invoke {
                    route,
                    message,
                    epoch,
                } => self.invoke(route, message, epoch).await,
            }
        }
        debug!(node = %self.node_id, "Node task finished");
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            if let Err(e) = self.bus.publish(&self.node_id, event) {
                debug!(node = %self.node_id, error = %e, "Broadcast skipped");
            }
        }
    }

    async fn invoke(&mut self, index: usize, message: Message, epoch: u64) {
        {
            let mut slot = lock(&self.slots[index]);
            slot.pending = slot.pending.saturating_sub(1);
        }
        let route = &self.routes[index];

        if let Some(map) = &route.map {
            let node = &mut self.node;
            match std::panic::catch_unwind(AssertUnwindSafe(|| map(node, &message))) {
                Ok(events) if route.broadcast => self.publish(events),
                Ok(_) => {}
                Err(_) => {
                    error!(node = %self.node_id, route = index, "Map stage panicked");
                    return;
                }
            }
        }

        let Some(stream_fn) = &route.stream else {
            return;
        };

        let token = {
            let mut slot = lock(&self.slots[index]);
            if slot.epoch != epoch {
                debug!(
                    node = %self.node_id,
                    route = index,
                    seq = message.id,
                    "Trigger superseded by interrupt, skipping stream"
                );
                return;
            }
            let token = self.shutdown.child_token();
            slot.active = Some(token.clone());
            slot.interrupted_by = None;
            token
        };

        let seq = message.id;
        let mut cancelled = false;
        let mut produced = 0usize;
        {
            let mut stream = stream_fn(&mut self.node, message);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    item = AssertUnwindSafe(stream.next()).catch_unwind() => match item {
                        Ok(Some(event)) => {
                            produced += 1;
                            if route.broadcast && !token.is_cancelled() {
                                if let Err(e) = self.bus.publish(&self.node_id, event) {
                                    debug!(node = %self.node_id, error = %e, "Broadcast skipped");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            error!(node = %self.node_id, route = index, "Stream stage panicked");
                            break;
                        }
                    }
                }
            }
        }

        let interrupted_by = {
            let mut slot = lock(&self.slots[index]);
            slot.active = None;
            slot.interrupted_by.take()
        };

        let Some(interrupt) = interrupted_by.filter(|_| cancelled) else {
            debug!(node = %self.node_id, route = index, seq, produced, cancelled, "Stream finished");
            return;
        };

        info!(
            node = %self.node_id,
            route = index,
            seq,
            produced,
            interrupt = %interrupt.kind(),
            "Stream interrupted"
        );
        self.node.on_interrupt(&interrupt);
        if let Some((_, handler)) = &route.interrupt {
            let node = &mut self.node;
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(node, &interrupt))) {
                Ok(events) if route.broadcast => self.publish(events),
                Ok(_) => {}
                Err(_) => error!(node = %self.node_id, route = index, "Interrupt handler panicked"),
            }
        }
    }
}
