//! Streaming Session Manager & Streaming Actor.
//!
//! A streaming handler hands back a `StreamProducer` instead of a terminal
//! response (see `actor::HandlerOutcome::Streaming`). This module owns that
//! producer for the life of the session: it pulls updates, fans them out to
//! every configured response channel, retries a failed publish up to
//! `max_publish_retries` then drops that channel for the rest of the session,
//! and enforces the session's TTL. The retry-then-drop shape mirrors the
//! AMQP reconnect loop's posture (bounded retries, no unbounded retry storm)
//! though this module retries a publish, not a connection — connection-level
//! reconnect lives in the transport layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{DGResponse, HandlerConfig, ResponseChannel, SessionStatus, StopReason, StreamingSession};

/// Pull-based source of streaming updates. A handler that opts into streaming
/// returns one of these; `None` from `next()` ends the session with `Completed`.
#[async_trait]
pub trait StreamProducer: Send {
    async fn next(&mut self) -> Option<serde_json::Value>;
}

/// Publishes a response to one egress channel. Implemented by the transport
/// layer; the session manager only knows it can retry or give up.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn publish(&self, channel: ResponseChannel, response: &DGResponse) -> Result<()>;
}

/// Handed from a Handler Actor to the session manager when a handler's
/// outcome is `HandlerOutcome::Streaming`.
pub struct StreamingHandoff {
    pub handler_id: String,
    pub request_id: String,
    pub user_id: String,
    pub handler_type: String,
    pub config: HandlerConfig,
    pub producer: Box<dyn StreamProducer>,
}

/// Owns every active `StreamingSession` and the task driving each producer.
pub struct StreamingSessionManager {
    sessions: Arc<RwLock<HashMap<String, StreamingSession>>>,
    publisher: Arc<dyn UpdatePublisher>,
    max_concurrent_sessions: usize,
    max_publish_retries: u32,
    default_ttl_minutes: u32,
    max_ttl_minutes: u32,
}

impl StreamingSessionManager {
    pub fn new(
        publisher: Arc<dyn UpdatePublisher>,
        max_concurrent_sessions: usize,
        max_publish_retries: u32,
        default_ttl_minutes: u32,
        max_ttl_minutes: u32,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            publisher,
            max_concurrent_sessions,
            max_publish_retries,
            default_ttl_minutes,
            max_ttl_minutes,
        }
    }

    /// Resolves a handler-supplied `ttl_minutes` against `[1, max_ttl_minutes]`,
    /// defaulting an unset (zero) value to `default_ttl_minutes`.
    fn resolve_ttl_minutes(&self, requested: u32) -> u32 {
        let requested = if requested == 0 { self.default_ttl_minutes } else { requested };
        requested.clamp(1, self.max_ttl_minutes.max(1))
    }

    /// Spawns the periodic sweep at `1/5 * default_ttl` cadence.
    /// TTL is a sliding idle timeout: each session's own drive loop also
    /// re-arms against `last_update_at` after every update, so this sweep is
    /// a backstop for a session whose producer never wakes the select loop
    /// on its own (it still can't outlive `last_update_at + ttl`).
    pub fn spawn_ttl_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs((u64::from(self.default_ttl_minutes) * 60 / 5).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<StreamingSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<StreamingSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Accepts a new streaming handoff, registers its session, and spawns the
    /// task that drives the producer to completion or TTL expiry. Rejects with
    /// `Backpressure` once `max_concurrent_sessions` is reached.
    pub async fn start(&self, handoff: StreamingHandoff) -> Result<String> {
        if self.sessions.read().await.len() >= self.max_concurrent_sessions {
            return Err(crate::error::Error::Backpressure);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl_minutes = self.resolve_ttl_minutes(handoff.config.ttl_minutes);
        let session = StreamingSession {
            session_id: session_id.clone(),
            handler_id: handoff.handler_id.clone(),
            request_id: handoff.request_id.clone(),
            user_id: handoff.user_id.clone(),
            handler_type: handoff.handler_type.clone(),
            status: SessionStatus::Starting,
            ttl_minutes,
            started_at: now,
            last_update_at: now,
            response_channels: handoff.config.default_response_channels.clone(),
            update_count: 0,
        };
        self.sessions.write().await.insert(session_id.clone(), session);

        let sessions = Arc::clone(&self.sessions);
        let publisher = Arc::clone(&self.publisher);
        let max_publish_retries = self.max_publish_retries;
        let ttl = Duration::from_secs(u64::from(ttl_minutes) * 60);
        let sid = session_id.clone();

        tokio::spawn(async move {
            drive_session(sid, handoff.request_id, handoff.producer, sessions, publisher, ttl, max_publish_retries).await;
        });

        Ok(session_id)
    }

    /// Requests cooperative shutdown of a session. The drive loop observes the
    /// `Stopping` status on its next iteration and winds down with `Cancelled`.
    pub async fn stop(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Stopping;
            }
        }
    }

    /// Stops sessions whose `last_update_at + ttl` has elapsed.
    pub async fn sweep_expired(&self) {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        for session in sessions.values_mut() {
            if session.status.is_terminal() {
                continue;
            }
            let ttl_secs = i64::from(session.ttl_minutes) * 60;
            if now.signed_duration_since(session.last_update_at).num_seconds() >= ttl_secs {
                session.status = SessionStatus::Stopping;
            }
        }
    }
}

async fn drive_session(
    session_id: String,
    request_id: String,
    mut producer: Box<dyn StreamProducer>,
    sessions: Arc<RwLock<HashMap<String, StreamingSession>>>,
    publisher: Arc<dyn UpdatePublisher>,
    ttl: Duration,
    max_publish_retries: u32,
) {
    set_status(&sessions, &session_id, SessionStatus::Active).await;

    let stop_reason = loop {
        if should_stop(&sessions, &session_id).await {
            break StopReason::Cancelled;
        }

        // TTL is a sliding idle timeout bounded by `last_update_at + ttl`,
        // so the wait is recomputed every iteration rather than armed once
        // against a fixed deadline.
        let idle_for = remaining_idle_budget(&sessions, &session_id, ttl).await;

        let update = tokio::select! {
            _ = tokio::time::sleep(idle_for) => {
                break StopReason::TimedOut;
            }
            update = producer.next() => update,
        };

        match update {
            Some(payload) => {
                let channels = channels_for(&sessions, &session_id).await;
                let response = DGResponse::streaming_update(request_id.clone(), payload);
                let dead = publish_with_retry(&publisher, &channels, &response, max_publish_retries).await;
                if !dead.is_empty() {
                    remove_channels(&sessions, &session_id, &dead).await;
                }
                record_update(&sessions, &session_id).await;

                if channels_for(&sessions, &session_id).await.is_empty() {
                    break StopReason::Failed;
                }
            }
            None => break StopReason::Completed,
        }
    };

    let final_response = DGResponse::streaming_complete(request_id.clone(), stop_reason);
    let channels = channels_for(&sessions, &session_id).await;
    publish_with_retry(&publisher, &channels, &final_response, max_publish_retries).await;

    let final_status = match stop_reason {
        StopReason::Completed => SessionStatus::Stopped,
        StopReason::Cancelled => SessionStatus::Stopped,
        StopReason::TimedOut => SessionStatus::Stopped,
        StopReason::Failed => SessionStatus::Failed,
    };
    set_status(&sessions, &session_id, final_status).await;
    info!(session_id = %session_id, reason = ?stop_reason, "streaming session ended");
}

async fn should_stop(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str) -> bool {
    sessions
        .read()
        .await
        .get(session_id)
        .map(|s| matches!(s.status, SessionStatus::Stopping))
        .unwrap_or(true)
}

/// Time left before `last_update_at + ttl` elapses, zero if already past.
async fn remaining_idle_budget(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str, ttl: Duration) -> Duration {
    let last_update_at = match sessions.read().await.get(session_id) {
        Some(s) => s.last_update_at,
        None => return Duration::ZERO,
    };
    let elapsed = Utc::now().signed_duration_since(last_update_at).to_std().unwrap_or(Duration::ZERO);
    ttl.saturating_sub(elapsed)
}

async fn remove_channels(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str, dead: &[ResponseChannel]) {
    if let Some(session) = sessions.write().await.get_mut(session_id) {
        session.response_channels.retain(|c| !dead.contains(c));
    }
}

async fn channels_for(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str) -> Vec<ResponseChannel> {
    sessions
        .read()
        .await
        .get(session_id)
        .map(|s| s.response_channels.clone())
        .unwrap_or_default()
}

async fn set_status(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str, status: SessionStatus) {
    if let Some(session) = sessions.write().await.get_mut(session_id) {
        session.status = status;
    }
}

async fn record_update(sessions: &Arc<RwLock<HashMap<String, StreamingSession>>>, session_id: &str) {
    if let Some(session) = sessions.write().await.get_mut(session_id) {
        session.update_count += 1;
        session.last_update_at = Utc::now();
    }
}

/// Publishes to every channel, retrying a failed publish up to `max_retries`
/// times before giving up on that channel for this update. A stuck
/// subscriber never blocks the other channels or the producer. Returns the
/// channels whose retry budget was exhausted, for the caller to drop from
/// the session's `response_channels`.
async fn publish_with_retry(
    publisher: &Arc<dyn UpdatePublisher>,
    channels: &[ResponseChannel],
    response: &DGResponse,
    max_retries: u32,
) -> Vec<ResponseChannel> {
    let mut dead = Vec::new();
    for &channel in channels {
        let mut attempt = 0;
        loop {
            match publisher.publish(channel, response).await {
                Ok(()) => break,
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    warn!(?channel, attempt, error = %err, "retrying streaming publish");
                }
                Err(err) => {
                    warn!(?channel, error = %err, "giving up on streaming publish after exhausting retries, removing channel");
                    counter!("streaming_channel_removed", "channel" => format!("{channel:?}")).increment(1);
                    dead.push(channel);
                    break;
                }
            }
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingProducer {
        remaining: usize,
    }

    #[async_trait]
    impl StreamProducer for CountingProducer {
        async fn next(&mut self) -> Option<serde_json::Value> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(serde_json::json!({ "n": self.remaining }))
        }
    }

    struct RecordingPublisher {
        published: Mutex<Vec<(ResponseChannel, String)>>,
        fail_count: AtomicUsize,
    }

    #[async_trait]
    impl UpdatePublisher for RecordingPublisher {
        async fn publish(&self, channel: ResponseChannel, response: &DGResponse) -> Result<()> {
            if self.fail_count.load(Ordering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::error::Error::TransportFailed {
                    channel: "ws".to_string(),
                    reason: "simulated".to_string(),
                });
            }
            self.published.lock().unwrap().push((channel, format!("{:?}", response.status)));
            Ok(())
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            handler_class: "TickerHandler".to_string(),
            request_type: "ticker".to_string(),
            owner_user_id: "u1".to_string(),
            ttl_minutes: 1,
            streaming: true,
            default_response_channels: vec![ResponseChannel::WebSocket],
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn session_completes_and_publishes_all_updates_then_complete() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_count: AtomicUsize::new(0),
        });
        let manager = StreamingSessionManager::new(publisher.clone(), 10, 2, 30, 240);

        let session_id = manager
            .start(StreamingHandoff {
                handler_id: "h1".to_string(),
                request_id: "r1".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: config(),
                producer: Box::new(CountingProducer { remaining: 3 }),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if manager.get(&session_id).await.map(|s| s.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 4);
        assert_eq!(published.last().unwrap().1, "StreamingComplete");
    }

    #[tokio::test]
    async fn backpressure_once_session_limit_reached() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_count: AtomicUsize::new(0),
        });
        let manager = StreamingSessionManager::new(publisher, 1, 1, 30, 240);

        manager
            .start(StreamingHandoff {
                handler_id: "h1".to_string(),
                request_id: "r1".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: config(),
                producer: Box::new(CountingProducer { remaining: 100 }),
            })
            .await
            .unwrap();

        let err = manager
            .start(StreamingHandoff {
                handler_id: "h2".to_string(),
                request_id: "r2".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: config(),
                producer: Box::new(CountingProducer { remaining: 100 }),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::Error::Backpressure));
    }

    struct AlwaysFailingPublisher;

    #[async_trait]
    impl UpdatePublisher for AlwaysFailingPublisher {
        async fn publish(&self, _channel: ResponseChannel, _response: &DGResponse) -> Result<()> {
            Err(crate::error::Error::TransportFailed {
                channel: "ws".to_string(),
                reason: "simulated".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn exhausting_retries_on_every_channel_fails_the_session() {
        let manager = StreamingSessionManager::new(Arc::new(AlwaysFailingPublisher), 10, 1, 30, 240);

        let session_id = manager
            .start(StreamingHandoff {
                handler_id: "h1".to_string(),
                request_id: "r1".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: config(),
                producer: Box::new(CountingProducer { remaining: 3 }),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if manager.get(&session_id).await.map(|s| s.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let session = manager.get(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.response_channels.is_empty());
    }

    #[tokio::test]
    async fn ttl_minutes_is_clamped_and_defaulted() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_count: AtomicUsize::new(0),
        });
        let manager = StreamingSessionManager::new(publisher, 10, 2, 30, 60);

        let mut unset_ttl = config();
        unset_ttl.ttl_minutes = 0;
        let session_id = manager
            .start(StreamingHandoff {
                handler_id: "h1".to_string(),
                request_id: "r1".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: unset_ttl,
                producer: Box::new(CountingProducer { remaining: 0 }),
            })
            .await
            .unwrap();
        assert_eq!(manager.get(&session_id).await.unwrap().ttl_minutes, 30);

        let mut over_ttl = config();
        over_ttl.ttl_minutes = 1_000;
        let session_id = manager
            .start(StreamingHandoff {
                handler_id: "h2".to_string(),
                request_id: "r2".to_string(),
                user_id: "u1".to_string(),
                handler_type: "ticker".to_string(),
                config: over_ttl,
                producer: Box::new(CountingProducer { remaining: 0 }),
            })
            .await
            .unwrap();
        assert_eq!(manager.get(&session_id).await.unwrap().ttl_minutes, 60);
    }
}
