//! ActiveMQ transport variant.
//!
//! No JMS or STOMP client crate appears anywhere in this workspace's
//! dependency graph, so this speaks STOMP 1.2 directly over
//! `tokio::net::TcpStream` — STOMP is a small textual frame protocol
//! (`COMMAND\nheader:value\n\nbody\0`) and ActiveMQ accepts it natively,
//! so this is a protocol-level implementation rather than a stand-in for
//! a missing dependency. Reconnect shape matches the other transport
//! variants: jittered exponential backoff, reset on success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::{ConnectionState, MessageHandler, Publisher, Subscriber};
use crate::config::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::model::MessageEnvelope;

#[derive(Debug, Clone)]
pub struct StompConfig {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub destination: String,
}

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Reconnecting,
        _ => ConnectionState::Closed,
    }
}

fn conn_error(e: impl std::fmt::Display) -> Error {
    Error::TransportFailed {
        channel: "activemq".to_string(),
        reason: e.to_string(),
    }
}

struct StompFrame {
    command: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn encode_frame(command: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 64);
    out.extend_from_slice(command.as_bytes());
    out.push(b'\n');
    for (k, v) in headers {
        out.extend_from_slice(k.as_bytes());
        out.push(b':');
        out.extend_from_slice(v.as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out.extend_from_slice(body);
    out.push(0);
    out
}

async fn connect_and_handshake(config: &StompConfig) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((config.host.as_str(), config.port)).await.map_err(conn_error)?;

    let mut headers = vec![("accept-version", "1.2"), ("host", config.host.as_str())];
    if let Some(login) = &config.login {
        headers.push(("login", login.as_str()));
    }
    if let Some(passcode) = &config.passcode {
        headers.push(("passcode", passcode.as_str()));
    }

    let frame = encode_frame("CONNECT", &headers, b"");
    stream.write_all(&frame).await.map_err(conn_error)?;

    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.map_err(conn_error)?;
    if line.trim() != "CONNECTED" {
        return Err(Error::TransportFailed {
            channel: "activemq".to_string(),
            reason: format!("unexpected handshake response: {}", line.trim()),
        });
    }

    Ok(stream)
}

async fn read_frame(reader: &mut (impl tokio::io::AsyncBufRead + Unpin)) -> Result<StompFrame> {
    let mut command = String::new();
    reader.read_line(&mut command).await.map_err(conn_error)?;
    let command = command.trim().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.map_err(conn_error)?;
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.to_string(), v.to_string());
        }
    }

    let mut body = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        use tokio::io::AsyncReadExt;
        reader.read_exact(&mut byte).await.map_err(conn_error)?;
        if byte[0] == 0 {
            break;
        }
        body.push(byte[0]);
    }

    Ok(StompFrame { command, headers, body })
}

pub struct ActiveMqPublisher {
    config: StompConfig,
    stream: tokio::sync::Mutex<TcpStream>,
    state: Arc<AtomicU8>,
}

impl ActiveMqPublisher {
    pub async fn connect(config: StompConfig) -> Result<Self> {
        let stream = connect_and_handshake(&config).await?;
        Ok(Self {
            config,
            stream: tokio::sync::Mutex::new(stream),
            state: Arc::new(AtomicU8::new(1)),
        })
    }
}

#[async_trait]
impl Publisher for ActiveMqPublisher {
    async fn publish(&self, destination: &str, envelope: &MessageEnvelope) -> Result<()> {
        let headers = [
            ("destination", destination),
            ("content-type", envelope.content_type.as_str()),
            ("message-id", envelope.message_id.as_str()),
        ];
        let frame = encode_frame("SEND", &headers, &envelope.payload);
        let mut stream = self.stream.lock().await;
        stream.write_all(&frame).await.map_err(conn_error)?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct ActiveMqSubscriber {
    config: StompConfig,
    reconnect: ReconnectPolicy,
    state: Arc<AtomicU8>,
}

impl ActiveMqSubscriber {
    pub fn new(config: StompConfig, reconnect: ReconnectPolicy) -> Self {
        Self {
            config,
            reconnect,
            state: Arc::new(AtomicU8::new(0)),
        }
    }
}

#[async_trait]
impl Subscriber for ActiveMqSubscriber {
    async fn start(&self, handler: MessageHandler) -> Result<()> {
        let mut backoff = super::backoff(&self.reconnect).build();

        loop {
            self.state.store(0, Ordering::SeqCst);
            match connect_and_handshake(&self.config).await {
                Ok(mut stream) => {
                    let sub = encode_frame(
                        "SUBSCRIBE",
                        &[("destination", self.config.destination.as_str()), ("id", "0"), ("ack", "auto")],
                        b"",
                    );
                    if let Err(e) = stream.write_all(&sub).await {
                        warn!(error = %e, "activemq subscribe failed, retrying");
                        self.state.store(2, Ordering::SeqCst);
                        let delay = backoff.next().unwrap_or(self.reconnect.max);
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.state.store(1, Ordering::SeqCst);
                    info!(destination = %self.config.destination, "activemq subscriber connected");
                    backoff = super::backoff(&self.reconnect).build();

                    let mut reader = BufReader::new(&mut stream);
                    loop {
                        match read_frame(&mut reader).await {
                            Ok(frame) if frame.command == "MESSAGE" => {
                                let envelope = MessageEnvelope {
                                    message_id: frame.headers.get("message-id").cloned().unwrap_or_default(),
                                    timestamp: chrono::Utc::now(),
                                    content_type: frame
                                        .headers
                                        .get("content-type")
                                        .cloned()
                                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                                    headers: frame.headers,
                                    payload: frame.body,
                                };
                                handler(envelope).await;
                            }
                            Ok(_) => continue,
                            Err(e) => {
                                warn!(error = %e, "activemq frame read failed, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "activemq connect failed, retrying");
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
