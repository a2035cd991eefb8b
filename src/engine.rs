//! Execution Engine: the single entry point every ingress
//! adapter calls through. `submit` resolves identity, routing, and admission
//! in order and returns a future that resolves once the invocation produces
//! its first observable response — terminal for ordinary handlers, or
//! `STREAMING_STARTED` for ones that hand off to the Streaming Session
//! Manager.

use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::actor::{ExecuteRequest, Handler, HandlerDirectory, Supervisor};
use crate::error::{Error, Result};
use crate::model::{DGRequest, DGResponse, HandlerState};
use crate::registry::{HandlerConfigSource, HandlerRegistry};
use crate::ring::RecentStateRing;
use crate::streaming::{StreamingHandoff, StreamingSessionManager};
use crate::users::{UserService, UserSource};

pub struct ExecutionEngine {
    users: UserService,
    registry: HandlerRegistry,
    handlers: HandlerDirectory,
    supervisor: Supervisor,
    streaming: Arc<StreamingSessionManager>,
    recent_state: Arc<RecentStateRing>,
    handler_timeout: std::time::Duration,
    shutdown_drain: std::time::Duration,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: UserService,
        registry: HandlerRegistry,
        handlers: HandlerDirectory,
        max_pool_size: usize,
        mailbox_capacity: usize,
        streaming: Arc<StreamingSessionManager>,
        recent_state: Arc<RecentStateRing>,
        handler_timeout: std::time::Duration,
        cancellation_grace: std::time::Duration,
        shutdown_drain: std::time::Duration,
    ) -> Self {
        streaming.spawn_ttl_sweeper();
        Self {
            users,
            registry,
            handlers,
            supervisor: Supervisor::new(max_pool_size, mailbox_capacity, cancellation_grace),
            streaming,
            recent_state,
            handler_timeout,
            shutdown_drain,
        }
    }

    pub fn active_invocations(&self) -> usize {
        self.supervisor.active_count()
    }

    pub fn queued_invocations(&self) -> usize {
        self.supervisor.queued_count()
    }

    /// Runs the full dispatch path for one request:
    /// 1. resolve `api_key` to a user id, or fail `AUTH_FAILED`;
    /// 2. look up the `(user, request_type)` handler, or fail `NOT_FOUND`;
    /// 3. admit the invocation to the Supervisor, or fail `BACKPRESSURE`;
    /// 4. await the first response the handler produces.
    pub async fn submit(&self, mut request: DGRequest) -> DGResponse {
        let request_id = request.request_id.clone();
        let request_type = request.request_type.clone();
        let channel = format!("{:?}", request.source_channel);
        let payload_bytes = serde_json::to_vec(&request.payload).map(|v| v.len()).unwrap_or(0);
        let started = std::time::Instant::now();

        counter!("requests_started", "request_type" => request_type.clone(), "channel" => channel.clone(), "user" => "unresolved").increment(1);
        histogram!("payload_bytes", "request_type" => request_type.clone()).record(payload_bytes as f64);

        let user_id = match self.users.resolve_user_from_api_key(&request.api_key) {
            Some(id) => id,
            None => {
                counter!("requests_error", "request_type" => request_type, "reason" => "auth_failed").increment(1);
                return Error::AuthFailed.to_response(request_id);
            }
        };
        request.resolved_user_id = Some(user_id.clone());

        let config = match self.registry.find_handler(&user_id, &request.request_type) {
            Some(cfg) => cfg,
            None => {
                counter!("requests_error", "request_type" => request_type, "user" => user_id, "reason" => "not_found").increment(1);
                return Error::NotFound(request.request_type.clone()).to_response(request_id);
            }
        };

        let handler = match self.handlers.get(&config.handler_class) {
            Some(h) => h,
            None => {
                counter!("requests_error", "request_type" => request_type, "user" => user_id, "reason" => "not_found").increment(1);
                return Error::NotFound(config.handler_class.clone()).to_response(request_id);
            }
        };

        let response = self.dispatch(request, config, handler).await;

        histogram!("duration_ms", "request_type" => request_type.clone(), "user" => user_id.clone()).record(started.elapsed().as_millis() as f64);
        match response.status {
            crate::model::DGStatus::Timeout => {
                counter!("requests_timeout", "request_type" => request_type, "user" => user_id).increment(1);
            }
            crate::model::DGStatus::Error => {
                counter!("requests_error", "request_type" => request_type, "user" => user_id, "reason" => "handler").increment(1);
            }
            _ => {
                counter!("requests_success", "request_type" => request_type, "user" => user_id).increment(1);
            }
        }

        response
    }

    async fn dispatch(&self, request: DGRequest, config: crate::model::HandlerConfig, handler: Arc<dyn Handler>) -> DGResponse {
        let request_id = request.request_id.clone();
        let handler_id = format!("hdl-{}", uuid::Uuid::new_v4());

        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, mut handoff_rx) = mpsc::unbounded_channel();

        let ttl = self.ttl_for(&config);

        let admitted = self.supervisor.submit(ExecuteRequest {
            handler_id,
            request,
            config,
            handler,
            ttl,
            result_sink: result_tx,
            state_sink: state_tx,
            streaming_handoff: handoff_tx,
        });

        if let Err(err) = admitted {
            return err.to_response(request_id);
        }

        let recent_state = Arc::clone(&self.recent_state);
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                if state.state.is_terminal() {
                    recent_state.add(state);
                }
            }
        });

        let streaming = Arc::clone(&self.streaming);
        tokio::spawn(async move {
            if let Some(handoff) = handoff_rx.recv().await {
                if let Err(err) = streaming.start(handoff).await {
                    warn!(error = %err, "failed to start streaming session");
                }
            }
        });

        match result_rx.await {
            Ok(response) => response,
            Err(_) => Error::Internal.to_response(request_id),
        }
    }

    fn ttl_for(&self, config: &crate::model::HandlerConfig) -> std::time::Duration {
        if config.ttl_minutes == 0 {
            self.handler_timeout
        } else {
            std::time::Duration::from_secs(u64::from(config.ttl_minutes) * 60)
        }
    }

    /// Reloads both the Handler Registry and the User/API-Key Service from
    /// their sources. Reload is atomic per-store: in-flight
    /// invocations keep the snapshot they started with.
    pub async fn reload_configs(&self, handler_source: &dyn HandlerConfigSource, user_source: &dyn UserSource) -> anyhow::Result<()> {
        self.registry.reload(handler_source).await?;
        self.users.reload(user_source).await?;
        info!("execution engine reloaded registry and user service");
        Ok(())
    }

    pub fn recent_states(&self) -> Vec<HandlerState> {
        self.recent_state.get_all()
    }

    /// Stops the Supervisor from admitting new work, waits up to the
    /// configured drain deadline for active invocations to finish on their
    /// own, then force-cancels whatever remains; every active streaming
    /// session is also asked to stop.
    pub async fn shutdown(&self) {
        for session in self.streaming.list().await {
            self.streaming.stop(&session.session_id).await;
        }
        self.supervisor.shutdown(self.shutdown_drain).await;
        info!("execution engine shutdown requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{HandlerDirectory, HandlerOutcome};
    use crate::model::{HandlerConfig, ResponseChannel, SourceChannel};
    use crate::streaming::UpdatePublisher;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: DGRequest, _config: HandlerConfig, _cancel: CancellationToken) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::Terminal(DGResponse::success(request.request_id, request.payload)))
        }
    }

    struct NullPublisher;

    #[async_trait]
    impl UpdatePublisher for NullPublisher {
        async fn publish(&self, _channel: ResponseChannel, _response: &DGResponse) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> ExecutionEngine {
        let mut keys = HashMap::new();
        keys.insert("k-valid".to_string(), "alice".to_string());
        let mut users = HashMap::new();
        users.insert(
            "alice".to_string(),
            crate::users::UserInfo {
                username: "alice".to_string(),
                password: "x".to_string(),
                enabled: true,
                roles: Default::default(),
            },
        );
        let user_service = UserService::new(users, keys);

        let registry = HandlerRegistry::new(vec![HandlerConfig {
            handler_class: "echo".to_string(),
            request_type: "echo".to_string(),
            owner_user_id: "alice".to_string(),
            ttl_minutes: 1,
            streaming: false,
            default_response_channels: vec![ResponseChannel::WebSocket],
            options: Default::default(),
        }]);

        let directory = HandlerDirectory::new();
        directory.register("echo", Arc::new(Echo));

        let streaming = Arc::new(StreamingSessionManager::new(Arc::new(NullPublisher), 10, 1, 30, 240));
        let recent_state = Arc::new(RecentStateRing::new(100, std::time::Duration::from_secs(3600)));

        ExecutionEngine::new(
            user_service,
            registry,
            directory,
            4,
            4,
            streaming,
            recent_state,
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn auth_failed_for_unknown_key() {
        let engine = engine();
        let request = DGRequest::new("echo", "k-unknown", SourceChannel::Http);
        let response = engine.submit(request).await;
        assert!(matches!(response.status, crate::model::DGStatus::Error));
        assert_eq!(response.error_message.unwrap(), "Invalid or disabled API key");
    }

    #[tokio::test]
    async fn not_found_for_unrouted_request_type() {
        let engine = engine();
        let request = DGRequest::new("unknown_type", "k-valid", SourceChannel::Http);
        let response = engine.submit(request).await;
        assert!(matches!(response.status, crate::model::DGStatus::Error));
    }

    #[tokio::test]
    async fn success_roundtrip() {
        let engine = engine();
        let mut request = DGRequest::new("echo", "k-valid", SourceChannel::Http);
        request.payload = serde_json::json!({"a": 1});
        let response = engine.submit(request).await;
        assert!(matches!(response.status, crate::model::DGStatus::Success));
        assert_eq!(response.payload.unwrap(), serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn shutdown_stops_admitting_new_invocations() {
        let engine = engine();
        engine.shutdown().await;

        let request = DGRequest::new("echo", "k-valid", SourceChannel::Http);
        let response = engine.submit(request).await;
        assert!(matches!(response.status, crate::model::DGStatus::Error));
    }
}
