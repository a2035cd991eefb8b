//! Recent-State Ring: a bounded, thread-safe log of
//! recently completed handler invocations for operator visibility and
//! post-mortem debugging.
//!
//! Retention is two policies applied as an AND: capacity `N` (oldest
//! evicted on overflow) and age `T` (evicted once older than `T`
//! regardless of capacity). This is in-memory only and lost on restart
//! by design.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::model::HandlerState;

pub struct RecentStateRing {
    capacity: usize,
    retention: Duration,
    entries: RwLock<VecDeque<HandlerState>>,
}

impl RecentStateRing {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity,
            retention,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Appends a state, evicting anything over capacity or past retention.
    pub fn add(&self, state: HandlerState) {
        let mut entries = self.entries.write().expect("recent-state ring lock poisoned");
        entries.push_front(state);

        while entries.len() > self.capacity {
            entries.pop_back();
        }

        self.evict_expired(&mut entries);
    }

    /// Newest-first snapshot of everything still inside the retention window.
    pub fn get_all(&self) -> Vec<HandlerState> {
        let mut entries = self.entries.write().expect("recent-state ring lock poisoned");
        self.evict_expired(&mut entries);
        entries.iter().cloned().collect()
    }

    fn evict_expired(&self, entries: &mut VecDeque<HandlerState>) {
        let now = Utc::now();
        while let Some(oldest) = entries.back() {
            let age = now.signed_duration_since(oldest.started_at);
            if age.to_std().map(|d| d > self.retention).unwrap_or(false) {
                entries.pop_back();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InvocationState, SourceChannel};

    fn sample(handler_id: &str) -> HandlerState {
        HandlerState {
            handler_id: handler_id.to_string(),
            request_id: "r1".to_string(),
            request_type: "echo".to_string(),
            user_id: "u1".to_string(),
            handler_class: "EchoHandler".to_string(),
            source_channel: SourceChannel::Http,
            state: InvocationState::Done,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let ring = RecentStateRing::new(2, Duration::from_secs(3600));
        ring.add(sample("a"));
        ring.add(sample("b"));
        ring.add(sample("c"));

        let all = ring.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].handler_id, "c");
        assert_eq!(all[1].handler_id, "b");
    }

    #[test]
    fn evicts_past_retention_regardless_of_capacity() {
        let ring = RecentStateRing::new(100, Duration::from_secs(0));
        ring.add(sample("a"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(ring.get_all().is_empty());
    }

    #[test]
    fn newest_first_ordering() {
        let ring = RecentStateRing::new(10, Duration::from_secs(3600));
        ring.add(sample("a"));
        ring.add(sample("b"));
        let all = ring.get_all();
        assert_eq!(all[0].handler_id, "b");
        assert_eq!(all[1].handler_id, "a");
    }
}
