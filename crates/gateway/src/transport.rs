//! Transport abstraction.
//!
//! The harness only needs text frames in and text frames out. A WebSocket
//! is split into a [`TransportSource`] and a [`TransportSink`] so reading and
//! writing can proceed from different tasks; [`memory`] provides the same
//! pair over channels for tests and embedding.

use async_trait::async_trait;
use parley_core::TransportError;

/// Inbound half of a connection.
#[async_trait]
pub trait TransportSource: Send + 'static {
    /// Next text frame. `Ok(None)` means the peer disconnected.
    async fn next_text(&mut self) -> Result<Option<String>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait TransportSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub mod websocket {
    //! axum WebSocket transport.

    use super::*;
    use axum::extract::ws::{Message as WsMessage, WebSocket};
    use futures::stream::{SplitSink, SplitStream};
    use futures::{SinkExt, StreamExt};

    pub struct WsSource {
        inner: SplitStream<WebSocket>,
    }

    pub struct WsSink {
        inner: SplitSink<WebSocket, WsMessage>,
    }

    /// Split an upgraded socket into its two halves.
    pub fn split(socket: WebSocket) -> (WsSource, WsSink) {
        let (sink, stream) = socket.split();
        (WsSource { inner: stream }, WsSink { inner: sink })
    }

    #[async_trait]
    impl TransportSource for WsSource {
        async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
            loop {
                match self.inner.next().await {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                    // Binary, ping and pong frames carry nothing for us.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                }
            }
        }
    }

    #[async_trait]
    impl TransportSink for WsSink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.inner
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.inner
                .close()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }
    }
}

pub mod memory {
    //! In-process transport backed by channels.
    //!
    //! [`pair`] returns the agent-side halves plus a [`MemoryPeer`] that plays
    //! the remote end: it injects frames and reads what the agent sent.

    use super::*;
    use crate::protocol::OutputMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Inbound {
        Text(String),
        Error(TransportError),
        Close,
    }

    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Inbound>,
    }

    pub struct MemorySink {
        tx: mpsc::UnboundedSender<String>,
    }

    pub struct MemoryPeer {
        to_agent: mpsc::UnboundedSender<Inbound>,
        from_agent: mpsc::UnboundedReceiver<String>,
    }

    pub fn pair() -> (MemorySource, MemorySink, MemoryPeer) {
        let (to_agent, rx) = mpsc::unbounded_channel();
        let (tx, from_agent) = mpsc::unbounded_channel();
        (
            MemorySource { rx },
            MemorySink { tx },
            MemoryPeer {
                to_agent,
                from_agent,
            },
        )
    }

    #[async_trait]
    impl TransportSource for MemorySource {
        async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
            match self.rx.recv().await {
                Some(Inbound::Text(text)) => Ok(Some(text)),
                Some(Inbound::Error(e)) => Err(e),
                Some(Inbound::Close) | None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl TransportSink for MemorySink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.tx.send(text).map_err(|_| TransportError::Disconnected)
        }
    }

    impl MemoryPeer {
        /// Send a raw text frame.
        pub fn send_raw(&self, text: impl Into<String>) {
            let _ = self.to_agent.send(Inbound::Text(text.into()));
        }

        /// Send a JSON frame.
        pub fn send_json(&self, value: serde_json::Value) {
            self.send_raw(value.to_string());
        }

        /// Make the agent's next read fail.
        pub fn inject_error(&self, error: TransportError) {
            let _ = self.to_agent.send(Inbound::Error(error));
        }

        /// Close the connection from the peer side.
        pub fn disconnect(&self) {
            let _ = self.to_agent.send(Inbound::Close);
        }

        /// Next frame the agent sent, decoded. `None` on timeout, hang-up, or
        /// a frame that is not a valid output message.
        pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<OutputMessage> {
            let text = tokio::time::timeout(timeout, self.from_agent.recv())
                .await
                .ok()??;
            serde_json::from_str(&text).ok()
        }

        pub async fn recv(&mut self) -> Option<OutputMessage> {
            self.recv_timeout(Duration::from_secs(5)).await
        }

        /// Every frame already sent by the agent, without waiting.
        pub fn drain(&mut self) -> Vec<OutputMessage> {
            let mut out = Vec::new();
            while let Ok(text) = self.from_agent.try_recv() {
                if let Ok(message) = serde_json::from_str(&text) {
                    out.push(message);
                }
            }
            out
        }
    }

}
