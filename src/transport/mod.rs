//! Transport Publisher/Subscriber abstraction.
//!
//! One trait pair covers every wire transport the facade sits on top of:
//! Kafka, RabbitMQ (AMQP), ActiveMQ (STOMP), and WebSocket. Each concrete
//! adapter owns its own reconnect loop with exponential backoff and jitter,
//! the same `consume_with_reconnect` shape applied to whichever broker
//! client owns the connection.

pub mod amqp;
pub mod jms;
pub mod kafka;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::MessageEnvelope;

/// Current state of a transport's underlying connection, surfaced for
/// operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Publishes envelopes onto a transport-specific destination (topic, queue,
/// exchange, socket). Implementations retry at the connection level; a
/// `publish` call only fails once its own retry budget for that attempt is
/// exhausted.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, destination: &str, envelope: &MessageEnvelope) -> Result<()>;
    fn state(&self) -> ConnectionState;
}

/// Consumes envelopes from a transport-specific source, invoking `handler`
/// for each one. `start` runs until cancelled or the process exits; it owns
/// its own reconnect loop and never returns on a transient failure.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn start(&self, handler: MessageHandler) -> Result<()>;
    fn state(&self) -> ConnectionState;
}

pub type MessageHandler = std::sync::Arc<dyn Fn(MessageEnvelope) -> BoxFuture + Send + Sync>;
pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Builds the jittered exponential backoff every transport variant shares
///.
pub(crate) fn backoff(policy: &crate::config::ReconnectPolicy) -> backon::ExponentialBuilder {
    backon::ExponentialBuilder::default()
        .with_min_delay(policy.initial)
        .with_max_delay(policy.max)
        .with_jitter()
}
