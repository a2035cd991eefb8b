//! Handler Configuration Registry.
//!
//! Holds a copy-on-write map `(user_id, request_type) -> HandlerConfig`.
//! Readers take a cheap `Arc` clone of the current snapshot and never
//! block on `reload`; a reload swaps the pointer atomically so a reader
//! observes either the pre- or post-reload map, never a partial one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::model::HandlerConfig;

pub type HandlerKey = (String, String);

/// Where `reload()` fetches the next snapshot from. Implemented by whatever
/// out-of-scope config store the deployment uses (file, database, control plane);
/// the registry itself only needs a way to pull a full map.
#[async_trait]
pub trait HandlerConfigSource: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<HandlerConfig>>;
}

#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<Arc<HashMap<HandlerKey, HandlerConfig>>>>,
}

impl HandlerRegistry {
    pub fn new(configs: Vec<HandlerConfig>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Self::index(configs)))),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn index(configs: Vec<HandlerConfig>) -> HashMap<HandlerKey, HandlerConfig> {
        configs
            .into_iter()
            .map(|c| ((c.owner_user_id.clone(), c.request_type.clone()), c))
            .collect()
    }

    /// O(1) lookup against whichever snapshot was current when the caller took its reference.
    pub fn find_handler(&self, user_id: &str, request_type: &str) -> Option<HandlerConfig> {
        let snapshot = self.snapshot();
        snapshot.get(&(user_id.to_string(), request_type.to_string())).cloned()
    }

    pub fn get_all_request_types(&self) -> HashSet<String> {
        self.snapshot().values().map(|c| c.request_type.clone()).collect()
    }

    /// Takes a reference to the current snapshot; subsequent reloads don't affect it.
    pub fn snapshot(&self) -> Arc<HashMap<HandlerKey, HandlerConfig>> {
        Arc::clone(&self.inner.read().expect("registry lock poisoned"))
    }

    /// Atomically replaces the map. In-flight invocations holding an earlier
    /// snapshot (via `snapshot()`) are unaffected.
    pub fn reload_from(&self, configs: Vec<HandlerConfig>) {
        let next = Arc::new(Self::index(configs));
        *self.inner.write().expect("registry lock poisoned") = next;
        info!("handler registry reloaded");
    }

    pub async fn reload(&self, source: &dyn HandlerConfigSource) -> anyhow::Result<()> {
        let configs = source.load_all().await?;
        self.reload_from(configs);
        Ok(())
    }
}
