//! WebSocket transport variant, built on `tokio-tungstenite`.
//!
//! Unlike the broker variants, a WebSocket connection is addressed by the
//! caller's own connection id rather than a fixed topic/queue, so `publish`
//! takes that id as its destination and looks up the live sink in a shared
//! hub. The server accepts inbound connections, registers each one's write
//! half into the hub, and forwards incoming frames to the dispatch handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use super::{ConnectionState, MessageHandler, Publisher, Subscriber};
use crate::error::{Error, Result};
use crate::model::MessageEnvelope;

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Reconnecting,
        _ => ConnectionState::Closed,
    }
}

/// Shared table of live connections, addressed by connection id. Both the
/// publisher and the server share one hub so an inbound connection becomes
/// immediately reachable for outbound publishes.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, connection_id: String, sink: mpsc::UnboundedSender<Message>) {
        self.connections.write().await.insert(connection_id, sink);
    }

    async fn remove(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

pub struct WebSocketPublisher {
    hub: ConnectionHub,
    state: Arc<AtomicU8>,
}

impl WebSocketPublisher {
    pub fn new(hub: ConnectionHub) -> Self {
        Self {
            hub,
            state: Arc::new(AtomicU8::new(1)),
        }
    }
}

#[async_trait]
impl Publisher for WebSocketPublisher {
    /// `destination` is the connection id a prior inbound request (or the
    /// streaming handoff that started this session) arrived on.
    async fn publish(&self, destination: &str, envelope: &MessageEnvelope) -> Result<()> {
        let connections = self.hub.connections.read().await;
        let sink = connections.get(destination).ok_or_else(|| Error::TransportFailed {
            channel: "websocket".to_string(),
            reason: format!("no live connection for {destination}"),
        })?;
        sink.send(Message::Binary(envelope.payload.clone().into())).map_err(|_| Error::TransportFailed {
            channel: "websocket".to_string(),
            reason: "connection closed".to_string(),
        })
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct WebSocketServer {
    bind_addr: String,
    hub: ConnectionHub,
    state: Arc<AtomicU8>,
}

impl WebSocketServer {
    pub fn new(bind_addr: impl Into<String>, hub: ConnectionHub) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            hub,
            state: Arc::new(AtomicU8::new(0)),
        }
    }
}

#[async_trait]
impl Subscriber for WebSocketServer {
    /// Accepts connections until the listener fails, then backs off and
    /// rebinds — the same reconnect shape as the broker variants, applied
    /// to listener setup rather than an outbound connection.
    async fn start(&self, handler: MessageHandler) -> Result<()> {
        loop {
            self.state.store(0, Ordering::SeqCst);
            let listener = match TcpListener::bind(&self.bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, addr = %self.bind_addr, "websocket bind failed, retrying");
                    self.state.store(2, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            self.state.store(1, Ordering::SeqCst);
            info!(addr = %self.bind_addr, "websocket server listening");

            loop {
                let (tcp, _addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "websocket accept failed");
                        break;
                    }
                };

                let hub = self.hub.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_connection(tcp, hub, handler).await;
                });
            }

            self.state.store(2, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_routes_to_the_registered_connection_and_fails_for_unknown_ids() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("conn-1".to_string(), tx).await;

        let publisher = WebSocketPublisher::new(hub.clone());
        let envelope = MessageEnvelope {
            message_id: "m1".to_string(),
            timestamp: chrono::Utc::now(),
            content_type: "application/json".to_string(),
            headers: HashMap::new(),
            payload: b"{}".to_vec(),
        };

        publisher.publish("conn-1", &envelope).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, Message::Binary(envelope.payload.clone().into()));

        let err = publisher.publish("conn-missing", &envelope).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailed { .. }));

        hub.remove("conn-1").await;
        assert_eq!(hub.connection_count().await, 0);
    }
}

async fn handle_connection(tcp: tokio::net::TcpStream, hub: ConnectionHub, handler: MessageHandler) {
    let ws_stream = match tokio_tungstenite::accept_async(tcp).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    hub.register(connection_id.clone(), outbound_tx).await;

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                let envelope = MessageEnvelope {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: chrono::Utc::now(),
                    content_type: "application/octet-stream".to_string(),
                    headers: std::collections::HashMap::from([("connection_id".to_string(), connection_id.clone())]),
                    payload: data.into(),
                };
                handler(envelope).await;
            }
            Ok(Message::Text(text)) => {
                let envelope = MessageEnvelope {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: chrono::Utc::now(),
                    content_type: "application/json".to_string(),
                    headers: std::collections::HashMap::from([("connection_id".to_string(), connection_id.clone())]),
                    payload: text.into_bytes(),
                };
                handler(envelope).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "websocket read error");
                break;
            }
        }
    }

    hub.remove(&connection_id).await;
    writer_task.abort();
}
