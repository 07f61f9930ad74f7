// Transport seam for the chat session
// A Connector opens one duplex link that carries whole STOMP frames.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stomp::Frame;

pub mod websocket;

pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Link closed")]
    Closed,
}

/// One open connection. Dropping `outbound` closes the link; `inbound` yields
/// `None` once the peer or the network has closed it.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}
