//! Transport seams: a persistent socket and a request/response poller.
//!
//! Both are traits so the delivery loop can run against in-process doubles.

pub mod poller;
pub mod socket;

pub use poller::{FallbackPoller, HttpPollClient, PollPolicy};
pub use socket::{SocketChannel, SocketState, SocketStatus, TungsteniteConnector};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Inbound event from a live socket session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    /// The connection ended; carries the close reason when one was given.
    Closed(Option<String>),
}

/// Channel pair bridging the delivery loop and one live connection.
///
/// Dropping the session closes the underlying connection.
#[derive(Debug)]
pub struct SocketSession {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<SocketFrame>,
}

impl SocketSession {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<SocketFrame>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// Queue a text frame for the connection writer.
    pub fn send(&self, text: String) -> anyhow::Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| anyhow::anyhow!("socket writer has shut down"))
    }

    /// Next inbound frame; a finished reader reads as `Closed(None)`.
    pub async fn recv(&mut self) -> SocketFrame {
        self.incoming.recv().await.unwrap_or(SocketFrame::Closed(None))
    }
}

/// Opens persistent connections.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<SocketSession>;
}

/// Performs one request/response exchange of the fallback transport.
#[async_trait]
pub trait PollClient: Send + Sync {
    /// Send a request batch, return the response batch.
    async fn exchange(&self, events: Vec<Value>) -> anyhow::Result<Vec<Value>>;
}
