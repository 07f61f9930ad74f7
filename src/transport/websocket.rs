// WebSocket implementation of the Connector, one STOMP frame per text message

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use super::{Connector, Link, TransportError};
use crate::stomp::Frame;

#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        WebSocketConnector
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidEndpoint(url.to_string()));
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!("WebSocket opened to {}", url);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        // Writer: runs until every outbound sender is dropped
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_write
                    .send(tungstenite::Message::Text(frame.encode().into()))
                    .await
                {
                    error!("Failed to write {} frame: {}", frame.command, e);
                    break;
                }
            }
            if let Err(e) = ws_write.close().await {
                debug!("Error closing WebSocket: {}", e);
            }
        });

        // Reader: ends when the socket closes, which closes `inbound`
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(tungstenite::Message::Text(text)) => text.as_str().to_string(),
                    Ok(tungstenite::Message::Binary(bytes)) => {
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                };
                match Frame::parse(&text) {
                    Ok(Some(frame)) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {} // heart-beat
                    Err(e) => warn!("Dropping malformed STOMP frame: {}", e),
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
