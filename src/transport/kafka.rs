//! Kafka transport variant built on `rdkafka`: a custom `ConsumerContext`
//! for rebalance logging, `FutureProducer` for sends, `MessageEnvelope` as
//! the uniform payload carried over the shared reconnect loop.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::StreamExt;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, ClientContext};
use tracing::{error, info, warn};

use super::{BoxFuture, ConnectionState, MessageHandler, Publisher, Subscriber};
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::model::MessageEnvelope;

/// Bootstrap servers, consumer group, and topic list for one Kafka client.
#[derive(Debug, Clone)]
pub struct KafkaTransportConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topics: Vec<String>,
}

struct RebalanceLogger;

impl ClientContext for RebalanceLogger {}

impl ConsumerContext for RebalanceLogger {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!(?rebalance, "kafka pre-rebalance");
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!(?rebalance, "kafka post-rebalance");
    }
}

type LoggingConsumer = StreamConsumer<RebalanceLogger>;

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Reconnecting,
        _ => ConnectionState::Closed,
    }
}

pub struct KafkaPublisher {
    producer: Arc<FutureProducer>,
    state: Arc<AtomicU8>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaTransportConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", "all")
            .create()
            .map_err(|e| Error::TransportFailed {
                channel: "kafka".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            producer: Arc::new(producer),
            state: Arc::new(AtomicU8::new(1)),
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, destination: &str, envelope: &MessageEnvelope) -> Result<()> {
        let key = envelope.message_id.clone();
        self.producer
            .send(
                FutureRecord::to(destination).key(&key).payload(&envelope.payload),
                std::time::Duration::from_secs(5),
            )
            .await
            .map_err(|(e, _)| {
                error!(error = %e, destination, "kafka publish failed");
                Error::TransportFailed {
                    channel: "kafka".to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct KafkaSubscriber {
    config: KafkaTransportConfig,
    reconnect: ReconnectPolicy,
    concurrency_limit: usize,
    state: Arc<AtomicU8>,
}

impl KafkaSubscriber {
    pub fn new(config: KafkaTransportConfig, reconnect: ReconnectPolicy, concurrency_limit: usize) -> Self {
        Self {
            config,
            reconnect,
            concurrency_limit,
            state: Arc::new(AtomicU8::new(0)),
        }
    }

    fn build_consumer(&self) -> Result<LoggingConsumer> {
        let consumer: LoggingConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", &self.config.group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "10000")
            .create_with_context(RebalanceLogger)
            .map_err(|e| Error::TransportFailed {
                channel: "kafka".to_string(),
                reason: e.to_string(),
            })?;

        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| Error::TransportFailed {
            channel: "kafka".to_string(),
            reason: e.to_string(),
        })?;

        Ok(consumer)
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    /// Runs forever, rebuilding the consumer and resuming on any stream error
    /// or disconnect, with exponential backoff reset on each successful
    /// connection.
    async fn start(&self, handler: MessageHandler) -> Result<()> {
        let mut backoff = super::backoff(&self.reconnect).build();

        loop {
            self.state.store(0, Ordering::SeqCst);
            match self.build_consumer() {
                Ok(consumer) => {
                    self.state.store(1, Ordering::SeqCst);
                    info!(topics = ?self.config.topics, "kafka consumer connected");
                    backoff = super::backoff(&self.reconnect).build();

                    consumer
                        .stream()
                        .filter_map(|msg| async { msg.ok() })
                        .map(|m| {
                            let handler = handler.clone();
                            async move {
                                if let Some(payload) = m.payload() {
                                    let envelope = MessageEnvelope {
                                        message_id: m.key().map(|k| String::from_utf8_lossy(k).to_string()).unwrap_or_default(),
                                        timestamp: chrono::Utc::now(),
                                        content_type: "application/octet-stream".to_string(),
                                        headers: Default::default(),
                                        payload: payload.to_vec(),
                                    };
                                    handler(envelope).await;
                                }
                            }
                        })
                        .buffer_unordered(self.concurrency_limit)
                        .for_each(|_| async {})
                        .await;

                    warn!("kafka consumer stream ended, reconnecting");
                }
                Err(err) => {
                    warn!(error = %err, "kafka consumer setup failed, retrying");
                }
            }

            self.state.store(2, Ordering::SeqCst);
            let delay = backoff.next().unwrap_or(self.reconnect.max);
            tokio::time::sleep(delay).await;
        }
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}
