//! Conversation harness: the protocol boundary of one call.
//!
//! A dedicated read task decodes inbound frames and only enqueues them; the
//! system's dispatch loop pulls from that queue at its own pace. Outbound
//! helpers encode typed messages and are suppressed once the call's shutdown
//! signal is set.
//!
//! Shutdown is set on transport disconnect, on too many consecutive read
//! failures, on `end_call`, on a failed send, and when a transfer's grace
//! period runs out.

use parley_config::HarnessConfig;
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{InputMessage, OutputMessage};
use crate::transport::{TransportSink, TransportSource};

/// Read-loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct HarnessSettings {
    pub read_retry_delay: Duration,
    pub max_consecutive_read_errors: u32,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for HarnessSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            read_retry_delay: Duration::from_millis(config.read_retry_delay_ms),
            max_consecutive_read_errors: config.max_consecutive_read_errors.max(1),
        }
    }
}

pub struct ConversationHarness {
    writer: tokio::sync::Mutex<Box<dyn TransportSink>>,
    reader: Mutex<Option<Box<dyn TransportSource>>>,
    queue_tx: mpsc::UnboundedSender<InputMessage>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InputMessage>>,
    shutdown: CancellationToken,
    input_task: Mutex<Option<JoinHandle<()>>>,
    settings: HarnessSettings,
}

impl ConversationHarness {
    pub fn new(
        source: Box<dyn TransportSource>,
        sink: Box<dyn TransportSink>,
        settings: HarnessSettings,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            writer: tokio::sync::Mutex::new(sink),
            reader: Mutex::new(Some(source)),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            shutdown: CancellationToken::new(),
            input_task: Mutex::new(None),
            settings,
        }
    }

    /// Spawn the read task. Calling it twice is a no-op.
    pub fn start(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(reader) = reader else {
            warn!("ConversationHarness already running");
            return;
        };

        debug!("Starting ConversationHarness");
        let task = tokio::spawn(read_loop(
            reader,
            self.queue_tx.clone(),
            self.shutdown.clone(),
            self.settings,
        ));
        *self.input_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Next decoded inbound message, or `None` once the call is shutting down.
    pub async fn next_input(&self) -> Option<InputMessage> {
        let mut queue = self.queue_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            message = queue.recv() => message,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Set the shutdown signal.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    async fn send(&self, output: OutputMessage) {
        if self.is_shutdown() {
            debug!(kind = output.kind(), "Shutdown set, suppressing outbound message");
            return;
        }
        let text = match output.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = output.kind(), error = %e, "Failed to encode outbound message");
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send_text(text).await {
            warn!(kind = output.kind(), error = %e, "Failed to send message over transport");
            self.shutdown.cancel();
        }
    }

    pub async fn send_message(&self, content: &str) {
        info!(content = %content, "Agent said");
        self.send(OutputMessage::Message {
            content: content.to_string(),
        })
        .await;
    }

    pub async fn send_error(&self, error: &str) {
        self.send(OutputMessage::Error {
            content: error.to_string(),
        })
        .await;
    }

    pub async fn send_tool_call(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        id: Option<String>,
        result: Option<String>,
    ) {
        self.send(OutputMessage::ToolCall {
            name: name.to_string(),
            arguments,
            result,
            id,
        })
        .await;
    }

    pub async fn send_dtmf(&self, button: &str) {
        self.send(OutputMessage::Dtmf {
            button: button.to_string(),
        })
        .await;
    }

    pub async fn log_event(&self, event: &str, metadata: Option<Map<String, Value>>) {
        debug!(event = %event, "Logging event");
        self.send(OutputMessage::LogEvent {
            event: event.to_string(),
            metadata,
        })
        .await;
    }

    pub async fn log_metric(&self, name: &str, value: Value) {
        debug!(name = %name, value = %value, "Logging metric");
        self.send(OutputMessage::LogMetric {
            name: name.to_string(),
            value,
        })
        .await;
    }

    /// Send `end_call` and set shutdown.
    pub async fn end_call(&self) {
        self.send(OutputMessage::EndCall).await;
        info!("End call message sent");
        self.shutdown.cancel();
    }

    /// Send `transfer`, then set shutdown once `timeout` elapses whether or
    /// not the second leg ever connects.
    pub async fn transfer_call(&self, target_phone_number: &str, timeout: Duration) {
        self.send(OutputMessage::Transfer {
            target_phone_number: target_phone_number.to_string(),
        })
        .await;
        info!(
            target = %target_phone_number,
            timeout_secs = timeout.as_secs_f64(),
            "Transfer requested, shutting down after grace period"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Transfer grace period elapsed, initiating shutdown");
                    shutdown.cancel();
                }
            }
        });
    }

    /// Set shutdown, stop the read task and discard unprocessed input.
    pub async fn cleanup(&self) {
        info!("Cleaning up ConversationHarness");
        self.shutdown.cancel();

        let task = self
            .input_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Input processor ended abnormally");
            }
        }

        let mut discarded = 0usize;
        {
            let mut queue = self.queue_rx.lock().await;
            while queue.try_recv().is_ok() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded unprocessed inbound messages");
        }

        if let Err(e) = self.writer.lock().await.close().await {
            debug!(error = %e, "Transport close failed");
        }
        info!("ConversationHarness cleanup completed");
    }
}

async fn read_loop(
    mut reader: Box<dyn TransportSource>,
    queue: mpsc::UnboundedSender<InputMessage>,
    shutdown: CancellationToken,
    settings: HarnessSettings,
) {
    let mut consecutive_errors = 0u32;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = reader.next_text() => next,
        };

        match next {
            Ok(Some(text)) => {
                consecutive_errors = 0;
                match InputMessage::decode(&text) {
                    Ok(message) => {
                        if queue.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable inbound message"),
                }
            }
            Ok(None) => {
                info!("Transport disconnected");
                shutdown.cancel();
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= settings.max_consecutive_read_errors {
                    error!(
                        error = %e,
                        consecutive_errors,
                        "Too many consecutive read errors, shutting down"
                    );
                    shutdown.cancel();
                    break;
                }
                warn!(error = %e, consecutive_errors, "Error in input processor, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(settings.read_retry_delay) => {}
                }
            }
        }
    }
    debug!("Input processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, MemoryPeer};
    use parley_core::TransportError;
    use serde_json::json;

    fn harness_with(settings: HarnessSettings) -> (ConversationHarness, MemoryPeer) {
        let (source, sink, peer) = memory::pair();
        let harness = ConversationHarness::new(Box::new(source), Box::new(sink), settings);
        (harness, peer)
    }

    fn harness() -> (ConversationHarness, MemoryPeer) {
        harness_with(HarnessSettings::default())
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let (harness, peer) = harness();
        harness.start();

        peer.send_raw("{definitely not json");
        peer.send_json(json!({"type": "message", "content": "hi"}));

        let message = harness.next_input().await.unwrap();
        assert_eq!(
            message,
            InputMessage::Message {
                content: "hi".into()
            }
        );
        assert!(!harness.is_shutdown());
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn disconnect_sets_shutdown() {
        let (harness, peer) = harness();
        harness.start();
        peer.disconnect();
        harness.wait_for_shutdown().await;
        assert!(harness.next_input().await.is_none());
        harness.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_retry_then_give_up() {
        let (harness, peer) = harness_with(HarnessSettings {
            read_retry_delay: Duration::from_millis(100),
            max_consecutive_read_errors: 3,
        });
        harness.start();

        peer.inject_error(TransportError::ReceiveFailed("glitch".into()));
        peer.send_json(json!({"type": "dtmf", "button": "1"}));
        assert_eq!(
            harness.next_input().await,
            Some(InputMessage::Dtmf { button: "1".into() })
        );
        assert!(!harness.is_shutdown());

        for _ in 0..3 {
            peer.inject_error(TransportError::ReceiveFailed("dead".into()));
        }
        harness.wait_for_shutdown().await;
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn end_call_suppresses_later_sends() {
        let (harness, mut peer) = harness();
        harness.send_message("Goodbye!").await;
        harness.end_call().await;
        harness.send_message("too late").await;

        assert_eq!(
            peer.drain(),
            vec![
                OutputMessage::Message {
                    content: "Goodbye!".into()
                },
                OutputMessage::EndCall,
            ]
        );
        assert!(harness.is_shutdown());
    }

    #[tokio::test]
    async fn failed_send_sets_shutdown() {
        let (harness, peer) = harness();
        drop(peer);
        harness.send_error("boom").await;
        assert!(harness.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_times_out_into_shutdown() {
        let (harness, mut peer) = harness();
        harness.transfer_call("+15550100", Duration::from_secs(5)).await;
        assert_eq!(
            peer.drain(),
            vec![OutputMessage::Transfer {
                target_phone_number: "+15550100".into()
            }]
        );

        tokio::time::advance(Duration::from_millis(4_999)).await;
        tokio::task::yield_now().await;
        assert!(!harness.is_shutdown());

        tokio::time::advance(Duration::from_millis(1)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(harness.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_grace_period_counts_from_the_request() {
        let (harness, _peer) = harness();
        harness.transfer_call("+15550100", Duration::from_secs(5)).await;

        // The timer task has not been polled yet; the deadline is already fixed.
        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(harness.is_shutdown());
    }

    #[tokio::test]
    async fn cleanup_discards_queued_input() {
        let (harness, peer) = harness();
        harness.start();
        peer.send_json(json!({"type": "message", "content": "one"}));
        peer.send_json(json!({"type": "message", "content": "two"}));
        tokio::task::yield_now().await;

        harness.cleanup().await;
        assert!(harness.is_shutdown());
        assert!(harness.next_input().await.is_none());
    }

    #[tokio::test]
    async fn outbound_helpers_encode_messages() {
        let (harness, mut peer) = harness();
        let mut args = Map::new();
        args.insert("city".into(), json!("Paris"));
        harness
            .send_tool_call("weather", args.clone(), Some("t1".into()), Some("\"sunny\"".into()))
            .await;
        harness.send_dtmf("9").await;
        harness.log_event("escalation.alert", None).await;
        harness.log_metric("latency_ms", json!(42)).await;

        assert_eq!(
            peer.drain(),
            vec![
                OutputMessage::ToolCall {
                    name: "weather".into(),
                    arguments: args,
                    result: Some("\"sunny\"".into()),
                    id: Some("t1".into()),
                },
                OutputMessage::Dtmf { button: "9".into() },
                OutputMessage::LogEvent {
                    event: "escalation.alert".into(),
                    metadata: None,
                },
                OutputMessage::LogMetric {
                    name: "latency_ms".into(),
                    value: json!(42),
                },
            ]
        );
    }
}
