//! Handler Actor & Supervisor.
//!
//! A Handler Actor is a single-consumer worker bound to exactly one
//! invocation: it owns its `HandlerState` and its result sink exclusively,
//! so no locking is needed inside it. One mailbox per invocation, supervised
//! restart-none, cooperative cancellation: a plain Tokio task per invocation
//! plus a `oneshot` result sink and a `tokio_util::sync::CancellationToken`,
//! the same correlation-entry shape a timeout-bearing result sink needs
//! whether it's tracking a broker response or a handler invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DGRequest, DGResponse, HandlerConfig, HandlerState, InvocationState};
use crate::streaming::{StreamProducer, StreamingHandoff};

/// What a handler implementation returns once dispatched.
pub enum HandlerOutcome {
    /// A non-streaming handler's terminal result.
    Terminal(DGResponse),
    /// A streaming handler's initial ack plus the producer capability that
    /// will go on to emit updates.
    Streaming {
        initial: DGResponse,
        producer: Box<dyn StreamProducer>,
    },
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutcome>> + Send>>;

/// User-defined logic addressed by `(user, request_type)` and identified
/// opaquely by `handler_class` (spec Glossary).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: DGRequest, config: HandlerConfig, cancel: CancellationToken) -> Result<HandlerOutcome>;
}

/// Maps an opaque `handler_class` to the implementation the Supervisor dispatches to.
#[derive(Clone, Default)]
pub struct HandlerDirectory {
    handlers: Arc<std::sync::RwLock<std::collections::HashMap<String, Arc<dyn Handler>>>>,
}

impl HandlerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler_class: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .expect("handler directory lock poisoned")
            .insert(handler_class.into(), handler);
    }

    pub fn get(&self, handler_class: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().expect("handler directory lock poisoned").get(handler_class).cloned()
    }
}

/// Everything the Supervisor needs to run one invocation.
pub struct ExecuteRequest {
    pub handler_id: String,
    pub request: DGRequest,
    pub config: HandlerConfig,
    pub handler: Arc<dyn Handler>,
    pub ttl: Duration,
    pub result_sink: oneshot::Sender<DGResponse>,
    pub state_sink: mpsc::UnboundedSender<HandlerState>,
    pub streaming_handoff: mpsc::UnboundedSender<StreamingHandoff>,
}

/// Parent of Handler Actors: enforces pool sizing and fault containment
///. `max_pool_size` active invocations run
/// concurrently via a semaphore; overflow queues onto a bounded mailbox;
/// a full mailbox is immediate backpressure — no worker is ever spawned
/// for a rejected admission.
pub struct Supervisor {
    permits: Arc<Semaphore>,
    mailbox_tx: mpsc::Sender<ExecuteRequest>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    cancellation_grace: Duration,
}

impl Supervisor {
    pub fn new(max_pool_size: usize, mailbox_capacity: usize, cancellation_grace: Duration) -> Self {
        let permits = Arc::new(Semaphore::new(max_pool_size));
        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity);
        let active = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));
        let shutdown_token = CancellationToken::new();

        tokio::spawn(Self::dispatch_loop(
            mailbox_rx,
            Arc::clone(&permits),
            Arc::clone(&active),
            Arc::clone(&queued),
            shutdown_token.clone(),
            cancellation_grace,
        ));

        Self {
            permits,
            mailbox_tx,
            active,
            queued,
            stopping: Arc::new(AtomicBool::new(false)),
            shutdown_token,
            cancellation_grace,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Admits a request: spawns immediately if a permit is free, else enqueues,
    /// else fails with `Backpressure`. Never blocks the caller. Rejects
    /// everything once `shutdown` has been called.
    pub fn submit(&self, request: ExecuteRequest) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::Backpressure);
        }

        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            self.active.fetch_add(1, Ordering::SeqCst);
            let active = Arc::clone(&self.active);
            let shutdown = self.shutdown_token.clone();
            let grace = self.cancellation_grace;
            tokio::spawn(async move {
                run_invocation(request, shutdown, grace).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
            return Ok(());
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        match self.mailbox_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(Error::Backpressure)
            }
        }
    }

    /// Stops accepting new direct admissions; queued work already in the
    /// mailbox continues draining until the caller separately drops this handle.
    async fn dispatch_loop(
        mut mailbox_rx: mpsc::Receiver<ExecuteRequest>,
        permits: Arc<Semaphore>,
        active: Arc<AtomicUsize>,
        queued: Arc<AtomicUsize>,
        shutdown_token: CancellationToken,
        cancellation_grace: Duration,
    ) {
        while let Some(request) = mailbox_rx.recv().await {
            queued.fetch_sub(1, Ordering::SeqCst);
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            active.fetch_add(1, Ordering::SeqCst);
            let active = Arc::clone(&active);
            let shutdown = shutdown_token.clone();
            tokio::spawn(async move {
                run_invocation(request, shutdown, cancellation_grace).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
    }

    /// Stops admitting new work, waits up to `drain_deadline` for active
    /// invocations to finish on their own, then cancels whatever is left
    /// and lets each one use its own cancellation grace period to unwind.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        self.stopping.store(true, Ordering::SeqCst);

        let start = tokio::time::Instant::now();
        while self.active_count() > 0 && start.elapsed() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.active_count() > 0 {
            warn!(remaining = self.active_count(), "drain deadline elapsed, cancelling remaining invocations");
            self.shutdown_token.cancel();
        }
    }
}

/// Runs one invocation end to end: `IDLE -> RUNNING -> {COMPLETED,FAILED,TIMED_OUT,CANCELLED}`.
/// A worker panicking or returning an error transitions to FAILED; the supervisor
/// is unaffected — other workers keep running.
///
/// TTL expiry and a supervisor shutdown both complete the result sink
/// immediately (the caller never waits on a handler's cooperation), but the
/// cancellation token is signalled in that same instant, before the handler
/// future is ever dropped: this invocation then keeps polling it for up to
/// `grace` so a handler racing `cancel.cancelled()` in a `select!` actually
/// gets to observe the signal and release its resources, rather than being
/// torn down the moment the deadline wins.
async fn run_invocation(request: ExecuteRequest, shutdown: CancellationToken, grace: Duration) {
    let ExecuteRequest {
        handler_id,
        request: dg_request,
        config,
        handler,
        ttl,
        result_sink,
        state_sink,
        streaming_handoff,
    } = request;

    let mut state = HandlerState {
        handler_id: handler_id.clone(),
        request_id: dg_request.request_id.clone(),
        request_type: dg_request.request_type.clone(),
        user_id: dg_request.resolved_user_id.clone().unwrap_or_default(),
        handler_class: config.handler_class.clone(),
        source_channel: dg_request.source_channel,
        state: InvocationState::Running,
        started_at: Utc::now(),
        ended_at: None,
    };
    let _ = state_sink.send(state.clone());

    let cancel = CancellationToken::new();
    let request_id = dg_request.request_id.clone();
    let config_for_handoff = config.clone();

    let handler_fut = handler.handle(dg_request, config, cancel.clone());
    tokio::pin!(handler_fut);

    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            cancel.cancel();
            info!(handler_id = %handler_id, "shutdown requested, cancellation signalled");
            state.state = InvocationState::Cancelled;
            state.ended_at = Some(Utc::now());
            let _ = state_sink.send(state);
            let _ = result_sink.send(DGResponse::error(request_id.clone(), "invocation cancelled during shutdown"));
            if tokio::time::timeout(grace, &mut handler_fut).await.is_err() {
                warn!(handler_id = %handler_id, "handler abandoned after cancellation grace period elapsed");
            }
            return;
        }
        _ = tokio::time::sleep(ttl) => {
            cancel.cancel();
            info!(handler_id = %handler_id, "handler timed out, cancellation requested");
            state.state = InvocationState::TimedOut;
            state.ended_at = Some(Utc::now());
            let _ = state_sink.send(state);
            let _ = result_sink.send(DGResponse::timeout(request_id.clone()));
            if tokio::time::timeout(grace, &mut handler_fut).await.is_err() {
                warn!(handler_id = %handler_id, "handler abandoned after cancellation grace period elapsed");
            }
            return;
        }
        res = &mut handler_fut => res,
    };

    match outcome {
        Ok(HandlerOutcome::Terminal(response)) => {
            state.state = InvocationState::Done;
            state.ended_at = Some(Utc::now());
            let _ = state_sink.send(state);
            let _ = result_sink.send(response);
        }
        Ok(HandlerOutcome::Streaming { initial, producer }) => {
            state.state = InvocationState::Done;
            state.ended_at = Some(Utc::now());
            let _ = state_sink.send(state.clone());
            let _ = streaming_handoff.send(StreamingHandoff {
                handler_id,
                request_id: request_id.clone(),
                user_id: state.user_id.clone(),
                handler_type: state.request_type.clone(),
                config: config_for_handoff,
                producer,
            });
            let _ = result_sink.send(initial);
        }
        Err(err) => {
            warn!(handler_id = %handler_id, error = %err, "handler failed");
            state.state = InvocationState::Error;
            state.ended_at = Some(Utc::now());
            let _ = state_sink.send(state);
            let _ = result_sink.send(err.to_response(request_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResponseChannel, SourceChannel as Src};

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: DGRequest, _config: HandlerConfig, _cancel: CancellationToken) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::Terminal(DGResponse::success(request.request_id, request.payload)))
        }
    }

    struct Sleepy(Arc<AtomicBool>);

    #[async_trait]
    impl Handler for Sleepy {
        async fn handle(&self, _request: DGRequest, _config: HandlerConfig, cancel: CancellationToken) -> Result<HandlerOutcome> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(90 * 60)) => {}
                _ = cancel.cancelled() => { self.0.store(true, Ordering::SeqCst); }
            }
            Ok(HandlerOutcome::Terminal(DGResponse::success("never", serde_json::Value::Null)))
        }
    }

    fn cfg() -> HandlerConfig {
        HandlerConfig {
            handler_class: "echo".to_string(),
            request_type: "echo".to_string(),
            owner_user_id: "u1".to_string(),
            ttl_minutes: 1,
            streaming: false,
            default_response_channels: vec![ResponseChannel::WebSocket],
            options: Default::default(),
        }
    }

    fn request() -> DGRequest {
        let mut r = DGRequest::new("echo", "k-valid", Src::Http);
        r.payload = serde_json::json!({"hello": "world"});
        r
    }

    #[tokio::test]
    async fn completes_successfully() {
        let supervisor = Supervisor::new(4, 4, Duration::from_millis(50));
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();

        supervisor
            .submit(ExecuteRequest {
                handler_id: format!("hdl-{}", Uuid::new_v4()),
                request: request(),
                config: cfg(),
                handler: Arc::new(Echo),
                ttl: Duration::from_secs(5),
                result_sink: result_tx,
                state_sink: state_tx,
                streaming_handoff: handoff_tx,
            })
            .unwrap();

        let response = result_rx.await.unwrap();
        assert!(matches!(response.status, crate::model::DGStatus::Success));
    }

    #[tokio::test]
    async fn timeout_cancels_and_completes_with_timeout_status() {
        let supervisor = Supervisor::new(4, 4, Duration::from_millis(200));
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();
        let cancelled_flag = Arc::new(AtomicBool::new(false));

        supervisor
            .submit(ExecuteRequest {
                handler_id: "hdl-timeout".to_string(),
                request: request(),
                config: cfg(),
                handler: Arc::new(Sleepy(Arc::clone(&cancelled_flag))),
                ttl: Duration::from_millis(20),
                result_sink: result_tx,
                state_sink: state_tx,
                streaming_handoff: handoff_tx,
            })
            .unwrap();

        let response = result_rx.await.unwrap();
        assert!(matches!(response.status, crate::model::DGStatus::Timeout));

        let mut saw_timed_out = false;
        while let Ok(state) = state_rx.try_recv() {
            saw_timed_out |= matches!(state.state, InvocationState::TimedOut);
        }
        assert!(saw_timed_out);

        // The grace period runs after the TIMEOUT response is already sent,
        // so give the handler's `cancel.cancelled()` branch a moment to fire.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cancelled_flag.load(Ordering::SeqCst), "handler never observed cooperative cancellation");
    }

    #[tokio::test]
    async fn backpressure_when_pool_and_mailbox_are_full() {
        let supervisor = Supervisor::new(1, 1, Duration::from_millis(50));
        let mut sinks = Vec::new();

        for i in 0..2 {
            let (result_tx, result_rx) = oneshot::channel();
            let (state_tx, _state_rx) = mpsc::unbounded_channel();
            let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();
            supervisor
                .submit(ExecuteRequest {
                    handler_id: format!("hdl-{i}"),
                    request: request(),
                    config: cfg(),
                    handler: Arc::new(Sleepy(Arc::new(AtomicBool::new(false)))),
                    ttl: Duration::from_secs(5),
                    result_sink: result_tx,
                    state_sink: state_tx,
                    streaming_handoff: handoff_tx,
                })
                .unwrap();
            sinks.push(result_rx);
        }

        let (result_tx, _result_rx) = oneshot::channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();
        let err = supervisor
            .submit(ExecuteRequest {
                handler_id: "hdl-rejected".to_string(),
                request: request(),
                config: cfg(),
                handler: Arc::new(Sleepy(Arc::new(AtomicBool::new(false)))),
                ttl: Duration::from_secs(5),
                result_sink: result_tx,
                state_sink: state_tx,
                streaming_handoff: handoff_tx,
            })
            .unwrap_err();

        assert!(matches!(err, Error::Backpressure));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_cancels_stragglers_past_the_drain_deadline() {
        let supervisor = Supervisor::new(4, 4, Duration::from_millis(200));
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();
        let cancelled_flag = Arc::new(AtomicBool::new(false));

        supervisor
            .submit(ExecuteRequest {
                handler_id: "hdl-straggler".to_string(),
                request: request(),
                config: cfg(),
                handler: Arc::new(Sleepy(Arc::clone(&cancelled_flag))),
                ttl: Duration::from_secs(90 * 60),
                result_sink: result_tx,
                state_sink: state_tx,
                streaming_handoff: handoff_tx,
            })
            .unwrap();

        supervisor.shutdown(Duration::from_millis(50)).await;

        let (result_tx, _result_rx) = oneshot::channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let (handoff_tx, _handoff_rx) = mpsc::unbounded_channel();
        let err = supervisor
            .submit(ExecuteRequest {
                handler_id: "hdl-after-shutdown".to_string(),
                request: request(),
                config: cfg(),
                handler: Arc::new(Echo),
                ttl: Duration::from_secs(5),
                result_sink: result_tx,
                state_sink: state_tx,
                streaming_handoff: handoff_tx,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure));

        let response = result_rx.await.unwrap();
        assert!(matches!(response.status, crate::model::DGStatus::Error));
        assert!(cancelled_flag.load(Ordering::SeqCst), "straggler was never cooperatively cancelled by shutdown");
    }
}
