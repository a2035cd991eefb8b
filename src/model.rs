//! Wire-level and internal data model shared by every component.
//!
//! Types here are the nouns the rest of the crate operates on: the
//! request/response envelopes exchanged with callers (`DGRequest`,
//! `DGResponse`), the routing and lifecycle records owned by the
//! Execution Engine and Handler Registry, and the transport-neutral
//! message envelope used by the Publisher/Subscriber abstraction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ingress transport a `DGRequest` arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceChannel {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "WebSocket")]
    WebSocket,
    #[serde(rename = "Kafka")]
    Kafka,
    #[serde(rename = "ActiveMQ")]
    ActiveMq,
    #[serde(rename = "RabbitMQ")]
    RabbitMq,
}

/// Egress channel a streaming update or terminal response can be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseChannel {
    #[serde(rename = "WebSocket")]
    WebSocket,
    #[serde(rename = "Kafka")]
    Kafka,
    #[serde(rename = "ActiveMQ")]
    ActiveMq,
    #[serde(rename = "RabbitMQ")]
    RabbitMq,
}

/// Terminal or intermediate status of a `DGResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DGStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "STREAMING_STARTED")]
    StreamingStarted,
    #[serde(rename = "STREAMING_UPDATE")]
    StreamingUpdate,
    #[serde(rename = "STREAMING_COMPLETE")]
    StreamingComplete,
}

impl DGStatus {
    /// A terminal response ends the lifecycle of its `request_id`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DGStatus::Success | DGStatus::Error | DGStatus::Timeout | DGStatus::StreamingComplete
        )
    }
}

/// Typed request accepted from any ingress surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DGRequest {
    pub request_id: String,
    pub request_type: String,
    pub api_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub source_channel: SourceChannel,
    #[serde(default)]
    pub resolved_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DGRequest {
    /// Builds a request with a server-assigned id and current timestamp, as an ingress adapter would.
    pub fn new(request_type: impl Into<String>, api_key: impl Into<String>, source_channel: SourceChannel) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            request_type: request_type.into(),
            api_key: api_key.into(),
            payload: serde_json::Value::Null,
            headers: HashMap::new(),
            source_channel,
            resolved_user_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Response returned from `ExecutionEngine::submit`, or published as a streaming update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DGResponse {
    pub request_id: String,
    pub status: DGStatus,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl DGResponse {
    pub fn success(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::Success,
            payload: Some(payload),
            error_message: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::Error,
            payload: None,
            error_message: Some(message.into()),
            emitted_at: Utc::now(),
        }
    }

    pub fn timeout(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::Timeout,
            payload: None,
            error_message: Some("handler did not complete within its time-to-live".to_string()),
            emitted_at: Utc::now(),
        }
    }

    pub fn streaming_started(request_id: impl Into<String>, session_id: &str) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::StreamingStarted,
            payload: Some(serde_json::json!({ "session_id": session_id })),
            error_message: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn streaming_update(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::StreamingUpdate,
            payload: Some(payload),
            error_message: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn streaming_complete(request_id: impl Into<String>, reason: StopReason) -> Self {
        Self {
            request_id: request_id.into(),
            status: DGStatus::StreamingComplete,
            payload: Some(serde_json::json!({ "reason": reason })),
            error_message: None,
            emitted_at: Utc::now(),
        }
    }
}

/// Reason a streaming session reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopReason {
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

/// Routing configuration for one `(owner_user_id, request_type)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfig {
    pub handler_class: String,
    pub request_type: String,
    pub owner_user_id: String,
    pub ttl_minutes: u32,
    pub streaming: bool,
    pub default_response_channels: Vec<ResponseChannel>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Lifecycle state of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationState {
    Queued,
    Running,
    Done,
    Error,
    TimedOut,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Done
                | InvocationState::Error
                | InvocationState::TimedOut
                | InvocationState::Cancelled
        )
    }
}

/// Operator-facing record of a handler invocation, owned exclusively by its actor
/// while running and retained in the Recent-State Ring after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerState {
    pub handler_id: String,
    pub request_id: String,
    pub request_type: String,
    pub user_id: String,
    pub handler_class: String,
    pub source_channel: SourceChannel,
    pub state: InvocationState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a long-lived streaming producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Starting,
    Active,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

/// A long-lived producer registered under one `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSession {
    pub session_id: String,
    pub handler_id: String,
    pub request_id: String,
    pub user_id: String,
    pub handler_type: String,
    pub status: SessionStatus,
    pub ttl_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    pub response_channels: Vec<ResponseChannel>,
    pub update_count: u64,
}

/// Transport-neutral carrier for a payload plus routing and identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub content_type: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Wraps a JSON-serializable value, stamping a fresh `message_id` so downstreams can
    /// dedupe retried deliveries.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            content_type: "application/json".to_string(),
            headers: HashMap::new(),
            payload: serde_json::to_vec(value)?,
        })
    }

    pub fn json_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
