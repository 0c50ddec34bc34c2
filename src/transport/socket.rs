use super::{SocketConnector, SocketFrame, SocketSession};
use crate::wire::{encode_batch_text, OutboundMessage};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<SocketSession> {
        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .context("Websocket connect timed out")?
                .with_context(|| format!("Websocket connect to {url} failed"))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketFrame>();

        // Single pump task owns both halves; it ends when either side closes.
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                break Some(e.to_string());
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break None;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(t))) => {
                            if in_tx.send(SocketFrame::Text(t.to_string())).is_err() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| f.reason.to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    },
                }
            };
            let _ = in_tx.send(SocketFrame::Closed(reason));
        });

        Ok(SocketSession::new(out_tx, in_rx))
    }
}

/// Connection lifecycle: `Disconnected -> Connecting -> Open -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Open,
}

/// Facts the fallback poller needs about the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketStatus {
    pub open: bool,
    pub ever_connected: bool,
    pub last_receive: Option<Instant>,
}

/// Socket side of the delivery loop.
#[derive(Debug)]
pub struct SocketChannel {
    state: SocketState,
    session: Option<SocketSession>,
    ever_connected: bool,
    last_receive: Option<Instant>,
}

impl Default for SocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketChannel {
    pub fn new() -> Self {
        Self {
            state: SocketState::Disconnected,
            session: None,
            ever_connected: false,
            last_receive: None,
        }
    }

    /// Endpoint for this client: base URL suffixed with the instance id.
    pub fn endpoint(base_url: &str, instance_id: &str) -> String {
        format!("{base_url}{instance_id}")
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SocketState::Open
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus {
            open: self.is_open(),
            ever_connected: self.ever_connected,
            last_receive: self.last_receive,
        }
    }

    pub fn begin_connect(&mut self) {
        self.state = SocketState::Connecting;
    }

    pub fn opened(&mut self, session: SocketSession, now: Instant) {
        self.session = Some(session);
        self.state = SocketState::Open;
        self.ever_connected = true;
        // Opening counts as activity so the silence window starts fresh.
        self.last_receive = Some(now);
    }

    pub fn connect_failed(&mut self) {
        self.session = None;
        self.state = SocketState::Disconnected;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = Some(now);
    }

    /// Drop the session; returns whether a live connection was torn down.
    pub fn close(&mut self) -> bool {
        let was_open = self.is_open();
        self.session = None;
        self.state = SocketState::Disconnected;
        was_open
    }

    /// Send one batch. A send on a closed socket is a no-op returning
    /// `false`; a send failure tears the session down and also returns
    /// `false` so the caller can schedule a reconnect.
    pub fn send_batch(&mut self, messages: &[OutboundMessage]) -> bool {
        if messages.is_empty() {
            return self.is_open();
        }
        let Some(session) = self.session.as_ref().filter(|_| self.is_open()) else {
            return false;
        };
        match session.send(encode_batch_text(messages)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Socket send failed, closing: {e}");
                self.close();
                false
            }
        }
    }

    /// Wait for the next frame; pends forever without a session.
    pub async fn next_frame(&mut self) -> SocketFrame {
        match self.session.as_mut() {
            Some(session) => session.recv().await,
            None => std::future::pending().await,
        }
    }
}
