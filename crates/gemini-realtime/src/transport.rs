//! Socket ownership with no protocol knowledge.
//!
//! A [`Transport`] opens one [`Connection`] per session attempt. The
//! connection is a pair of channels: frames to send, and events received in
//! arrival order. The engine consumes the inbound channel from a single task,
//! so frames are never dispatched concurrently.

use crate::error::LiveError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket close code for an abnormal closure with no close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// WebSocket close code for a policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// A frame queued for sending.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    /// Close the socket; nothing more is sent afterwards.
    Close,
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
    Error(String),
}

/// One open socket, expressed as channels.
pub struct Connection {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection to `url`.
    async fn open(&self, url: &str) -> Result<Connection, LiveError>;
}

/// Opens a connection, failing with [`LiveError::Connection`] after `timeout`.
pub async fn open_with_timeout(
    transport: &dyn Transport,
    url: &str,
    timeout: Duration,
) -> Result<Connection, LiveError> {
    match tokio::time::timeout(timeout, transport.open(url)).await {
        Ok(result) => result,
        Err(_) => Err(LiveError::Connection(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// A [`Transport`] over a TLS WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Connection, LiveError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| LiveError::Connection(e.to_string()))?;
        info!("Connected to live WebSocket.");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(256);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => ws_tx.send(WsMessage::Text(text.into())).await,
                    OutboundFrame::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to write to live WebSocket");
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!("Live WebSocket writer finished.");
        });

        tokio::spawn(async move {
            let mut closed = false;
            while let Some(msg_result) = ws_rx.next().await {
                let event = match msg_result {
                    Ok(WsMessage::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
                    Ok(WsMessage::Binary(bytes)) => TransportEvent::Binary(bytes.to_vec()),
                    Ok(WsMessage::Close(close_frame)) => {
                        closed = true;
                        match close_frame {
                            Some(frame) => TransportEvent::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => TransportEvent::Closed {
                                code: CLOSE_ABNORMAL,
                                reason: String::new(),
                            },
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Error reading from live WebSocket: {}", e);
                        closed = true;
                        TransportEvent::Error(e.to_string())
                    }
                };
                if inbound_tx.send(event).await.is_err() || closed {
                    break;
                }
            }
            if !closed {
                let _ = inbound_tx
                    .send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    })
                    .await;
            }
            debug!("Live WebSocket reader finished.");
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
