//! User / API-Key Service.
//!
//! Resolves an opaque api-key to a user id and exposes role/enabled
//! lookups, backed by an atomically-swapped snapshot in the same shape
//! as the Handler Registry — one map for users-by-name, one for
//! api-keys-by-value, reloaded together.
//!
//! Password comparison is plain equality (no hashing). This preserves an
//! existing no-op password encoder's observable behavior rather than
//! silently hardening it. See DESIGN.md for the accepted risk.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub password: String,
    pub enabled: bool,
    pub roles: HashSet<String>,
}

struct UserSnapshot {
    users_by_name: HashMap<String, UserInfo>,
    user_id_by_api_key: HashMap<String, String>,
}

#[async_trait]
pub trait UserSource: Send + Sync {
    /// Loads the full user table, keyed by username.
    async fn load_users(&self) -> anyhow::Result<HashMap<String, UserInfo>>;
    /// Loads the api-key -> username mapping.
    async fn load_api_keys(&self) -> anyhow::Result<HashMap<String, String>>;
}

#[derive(Clone)]
pub struct UserService {
    inner: Arc<RwLock<Arc<UserSnapshot>>>,
}

impl UserService {
    pub fn new(users: HashMap<String, UserInfo>, api_keys: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(UserSnapshot {
                users_by_name: users,
                user_id_by_api_key: api_keys,
            }))),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new(), HashMap::new())
    }

    fn snapshot(&self) -> Arc<UserSnapshot> {
        Arc::clone(&self.inner.read().expect("user service lock poisoned"))
    }

    /// Resolves an api-key to a user id. An api-key is valid iff it maps to an
    /// enabled user; disabled users never resolve, and keys are
    /// compared in constant time to avoid timing side-channels on the lookup key.
    pub fn resolve_user_from_api_key(&self, key: &str) -> Option<String> {
        let snapshot = self.snapshot();
        let user_id = snapshot
            .user_id_by_api_key
            .iter()
            .find(|(candidate, _)| constant_time_eq(candidate.as_bytes(), key.as_bytes()))
            .map(|(_, user_id)| user_id.clone())?;

        let enabled = snapshot
            .users_by_name
            .get(&user_id)
            .map(|u| u.enabled)
            .unwrap_or(false);

        enabled.then_some(user_id)
    }

    pub fn get_user_by_username(&self, name: &str) -> Option<UserInfo> {
        self.snapshot().users_by_name.get(name).cloned()
    }

    pub fn reload_from(&self, users: HashMap<String, UserInfo>, api_keys: HashMap<String, String>) {
        let next = Arc::new(UserSnapshot {
            users_by_name: users,
            user_id_by_api_key: api_keys,
        });
        *self.inner.write().expect("user service lock poisoned") = next;
    }

    pub async fn reload(&self, source: &dyn UserSource) -> anyhow::Result<()> {
        let users = source.load_users().await?;
        let api_keys = source.load_api_keys().await?;
        self.reload_from(users, api_keys);
        Ok(())
    }
}

/// Constant-time byte comparison so api-key lookups don't leak timing information
/// proportional to the mismatching prefix length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> UserService {
        let mut users = HashMap::new();
        users.insert(
            "alice".to_string(),
            UserInfo {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                enabled: true,
                roles: HashSet::from(["user".to_string()]),
            },
        );
        users.insert(
            "bob".to_string(),
            UserInfo {
                username: "bob".to_string(),
                password: "secret".to_string(),
                enabled: false,
                roles: HashSet::new(),
            },
        );

        let mut keys = HashMap::new();
        keys.insert("k-valid".to_string(), "alice".to_string());
        keys.insert("k-disabled".to_string(), "bob".to_string());

        UserService::new(users, keys)
    }

    #[test]
    fn resolves_enabled_user() {
        let svc = service();
        assert_eq!(svc.resolve_user_from_api_key("k-valid"), Some("alice".to_string()));
    }

    #[test]
    fn disabled_user_never_resolves() {
        let svc = service();
        assert_eq!(svc.resolve_user_from_api_key("k-disabled"), None);
    }

    #[test]
    fn unknown_key_does_not_resolve() {
        let svc = service();
        assert_eq!(svc.resolve_user_from_api_key("k-unknown"), None);
    }

    #[test]
    fn reload_swaps_snapshot_atomically() {
        let svc = service();
        svc.reload_from(HashMap::new(), HashMap::new());
        assert_eq!(svc.resolve_user_from_api_key("k-valid"), None);
    }
}
