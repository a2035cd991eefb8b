//! RabbitMQ (AMQP) transport variant: a `deadpool_lapin::Pool` plus a topic
//! exchange, with a `consume_with_reconnect` loop using `backon`'s
//! exponential-with-jitter builder, reset on every successful connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tracing::{error, info, warn};

use super::{ConnectionState, MessageHandler, Publisher, Subscriber};
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::model::MessageEnvelope;

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
}

impl AmqpConfig {
    pub fn publisher(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            queue: None,
            routing_key: None,
        }
    }

    pub fn subscriber(url: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            queue: Some(queue.into()),
            routing_key: Some(routing_key.into()),
        }
    }
}

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Reconnecting,
        _ => ConnectionState::Closed,
    }
}

fn pool_error(e: impl std::fmt::Display) -> Error {
    Error::TransportFailed {
        channel: "rabbitmq".to_string(),
        reason: e.to_string(),
    }
}

async fn declare_exchange(pool: &Pool, exchange: &str) -> Result<()> {
    let conn = pool.get().await.map_err(pool_error)?;
    let channel = conn.create_channel().await.map_err(pool_error)?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(pool_error)?;
    Ok(())
}

pub struct AmqpPublisher {
    pool: Pool,
    exchange: String,
    state: Arc<AtomicU8>,
}

impl AmqpPublisher {
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager).max_size(10).build().map_err(pool_error)?;
        declare_exchange(&pool, &config.exchange).await?;
        Ok(Self {
            pool,
            exchange: config.exchange,
            state: Arc::new(AtomicU8::new(1)),
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, destination: &str, envelope: &MessageEnvelope) -> Result<()> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        let channel = conn.create_channel().await.map_err(pool_error)?;
        channel
            .basic_publish(
                &self.exchange,
                destination,
                BasicPublishOptions::default(),
                &envelope.payload,
                BasicProperties::default().with_message_id(envelope.message_id.clone().into()),
            )
            .await
            .map_err(pool_error)?
            .await
            .map_err(pool_error)?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct AmqpSubscriber {
    pool: Pool,
    exchange: String,
    queue: String,
    routing_key: String,
    reconnect: ReconnectPolicy,
    state: Arc<AtomicU8>,
}

impl AmqpSubscriber {
    pub async fn connect(config: AmqpConfig, reconnect: ReconnectPolicy) -> Result<Self> {
        let queue = config.queue.clone().ok_or_else(|| Error::TransportFailed {
            channel: "rabbitmq".to_string(),
            reason: "no queue configured for subscriber".to_string(),
        })?;
        let routing_key = config.routing_key.clone().ok_or_else(|| Error::TransportFailed {
            channel: "rabbitmq".to_string(),
            reason: "no routing key configured for subscriber".to_string(),
        })?;

        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager).max_size(10).build().map_err(pool_error)?;
        declare_exchange(&pool, &config.exchange).await?;

        Ok(Self {
            pool,
            exchange: config.exchange,
            queue,
            routing_key,
            reconnect,
            state: Arc::new(AtomicU8::new(0)),
        })
    }

    async fn setup_consumer(&self) -> Result<lapin::Consumer> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        let channel = conn.create_channel().await.map_err(pool_error)?;

        channel
            .queue_declare(&self.queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(pool_error)?;

        channel
            .queue_bind(&self.queue, &self.exchange, &self.routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(pool_error)?;

        channel
            .basic_consume(&self.queue, "dgfacade", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(pool_error)
    }
}

#[async_trait]
impl Subscriber for AmqpSubscriber {
    /// Rebuilds the consumer on any setup failure or delivery error, with
    /// jittered exponential backoff reset on each successful connection.
    async fn start(&self, handler: MessageHandler) -> Result<()> {
        let mut backoff = super::backoff(&self.reconnect).build();

        loop {
            self.state.store(0, Ordering::SeqCst);
            // `network_recovery_interval` is the fixed delay RabbitMQ clients
            // use once a connection was live and then dropped,
            // distinct from the exponential backoff used while the consumer
            // has never successfully connected.
            let mut was_connected = false;

            match self.setup_consumer().await {
                Ok(mut consumer) => {
                    self.state.store(1, Ordering::SeqCst);
                    info!(queue = %self.queue, routing_key = %self.routing_key, "amqp consumer connected");
                    backoff = super::backoff(&self.reconnect).build();
                    was_connected = true;

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                let envelope = MessageEnvelope {
                                    message_id: delivery
                                        .properties
                                        .message_id()
                                        .as_ref()
                                        .map(|m| m.to_string())
                                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                                    timestamp: chrono::Utc::now(),
                                    content_type: "application/octet-stream".to_string(),
                                    headers: Default::default(),
                                    payload: delivery.data.clone(),
                                };
                                handler(envelope).await;
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    warn!(error = %e, "amqp ack failed");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "amqp delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    warn!(queue = %self.queue, "amqp consumer stream ended, reconnecting");
                }
                Err(err) => {
                    warn!(error = %err, "amqp consumer setup failed, retrying");
                }
            }

            self.state.store(2, Ordering::SeqCst);
            let delay = if was_connected {
                self.reconnect.network_recovery_interval
            } else {
                backoff.next().unwrap_or(self.reconnect.max)
            };
            tokio::time::sleep(delay).await;
        }
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}
