//! Permission cache for per-event application access.
//!
//! Memoizes "user U may observe application A" so the relays do not hit the
//! policy engine for every event. Only positive results are cached: a
//! cached `true` was validated by ownership or RBAC at insertion time, and
//! the sweep only removes entries. The sweep runs lazily on consultation,
//! gated to at most once per interval, and drops entries whose application
//! no longer exists.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::User;
use crate::rbac::PolicyEngine;
use crate::store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct PermissionCache {
    /// user name → application uid → granted.
    entries: RwLock<HashMap<String, HashMap<Uuid, bool>>>,
    last_sweep: Mutex<Instant>,
    sweep_interval: Duration,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        PermissionCache {
            entries: RwLock::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            sweep_interval,
        }
    }

    /// May `user` observe events of application `app_uid`? Grants on
    /// ownership, else on the elevated `(service, method)` policy check.
    pub async fn check(
        &self,
        store: &Store,
        policy: &PolicyEngine,
        user: &User,
        app_uid: Uuid,
        all_method: (&str, &str),
    ) -> bool {
        self.maybe_sweep(store).await;

        if let Some(granted) = self
            .entries
            .read()
            .await
            .get(&user.name)
            .and_then(|apps| apps.get(&app_uid))
        {
            return *granted;
        }

        let granted = match store.application_get(app_uid).await {
            None => false,
            Some(app) => {
                app.owner_name == user.name
                    || policy
                        .check_permission(&user.roles, all_method.0, all_method.1)
                        .await
            }
        };

        if granted {
            self.entries
                .write()
                .await
                .entry(user.name.clone())
                .or_default()
                .insert(app_uid, true);
        }
        granted
    }

    /// Lazy sweep, at most once per interval: drop entries whose
    /// application is gone.
    async fn maybe_sweep(&self, store: &Store) {
        {
            let mut last = self.last_sweep.lock().await;
            if last.elapsed() < self.sweep_interval {
                return;
            }
            *last = Instant::now();
        }

        let cached_uids: Vec<Uuid> = {
            let entries = self.entries.read().await;
            let mut uids: Vec<Uuid> = entries.values().flat_map(|apps| apps.keys().copied()).collect();
            uids.sort_unstable();
            uids.dedup();
            uids
        };

        let mut stale = Vec::new();
        for uid in cached_uids {
            if store.application_get(uid).await.is_none() {
                stale.push(uid);
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut entries = self.entries.write().await;
        for apps in entries.values_mut() {
            apps.retain(|uid, _| !stale.contains(uid));
        }
        entries.retain(|_, apps| !apps.is_empty());
        tracing::debug!("Permission cache sweep removed {} stale applications", stale.len());
    }

    #[cfg(test)]
    pub async fn cached(&self, user_name: &str, app_uid: Uuid) -> Option<bool> {
        self.entries
            .read()
            .await
            .get(user_name)
            .and_then(|apps| apps.get(&app_uid))
            .copied()
    }
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Application, Label, Permission, Role};
    use crate::rbac;
    use chrono::Utc;
    use std::sync::Arc;

    fn user(name: &str, roles: &[&str]) -> User {
        User {
            name: name.to_string(),
            password_hash: String::new(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            group: None,
            config: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn store_with_app(owner: &str) -> (Arc<Store>, Uuid) {
        let store = Store::new();
        let label_uid = Uuid::new_v4();
        store
            .label_insert(Label {
                uid: label_uid,
                name: "ubuntu".to_string(),
                version: 1,
                definitions: serde_json::Value::Null,
                created_at: Utc::now(),
            })
            .await;
        let app_uid = Uuid::new_v4();
        store
            .application_insert(Application {
                uid: app_uid,
                owner_name: owner.to_string(),
                label_uid,
                metadata: serde_json::Value::Null,
                created_at: Utc::now(),
            })
            .await;
        (store, app_uid)
    }

    #[tokio::test]
    async fn test_owner_is_granted_and_cached() {
        let (store, app_uid) = store_with_app("alice").await;
        let policy = PolicyEngine::new();
        let cache = PermissionCache::new();
        let alice = user("alice", &[]);

        assert!(
            cache
                .check(&store, &policy, &alice, app_uid, (rbac::services::APPLICATION, "get_state_all"))
                .await
        );
        assert_eq!(cache.cached("alice", app_uid).await, Some(true));
    }

    #[tokio::test]
    async fn test_negative_results_are_not_cached() {
        let (store, app_uid) = store_with_app("alice").await;
        let policy = PolicyEngine::new();
        let cache = PermissionCache::new();
        let bob = user("bob", &["User"]);

        assert!(
            !cache
                .check(&store, &policy, &bob, app_uid, (rbac::services::APPLICATION, "get_state_all"))
                .await
        );
        assert_eq!(cache.cached("bob", app_uid).await, None);
    }

    #[tokio::test]
    async fn test_elevated_role_is_granted() {
        let (store, app_uid) = store_with_app("alice").await;
        let policy = PolicyEngine::new();
        policy
            .sync_role(&Role {
                name: "Observer".to_string(),
                permissions: vec![Permission {
                    resource: rbac::services::APPLICATION.to_string(),
                    action: "get_state_all".to_string(),
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        let cache = PermissionCache::new();
        let bob = user("bob", &["Observer"]);

        assert!(
            cache
                .check(&store, &policy, &bob, app_uid, (rbac::services::APPLICATION, "get_state_all"))
                .await
        );
    }

    #[tokio::test]
    async fn test_sweep_drops_entries_for_missing_applications() {
        let policy = PolicyEngine::new();
        let cache = PermissionCache::with_sweep_interval(Duration::from_millis(0));
        let alice = user("alice", &[]);

        // Application exists at caching time, then disappears (separate store).
        let (store, app_uid) = store_with_app("alice").await;
        assert!(
            cache
                .check(&store, &policy, &alice, app_uid, (rbac::services::APPLICATION, "get_state_all"))
                .await
        );

        let empty_store = Store::new();
        // Consultation against a store without the application triggers the
        // sweep and the stale entry goes away.
        cache
            .check(&empty_store, &policy, &alice, Uuid::new_v4(), (rbac::services::APPLICATION, "get_state_all"))
            .await;
        assert_eq!(cache.cached("alice", app_uid).await, None);
    }
}
