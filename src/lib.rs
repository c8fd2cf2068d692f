use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod rbac;
pub mod routes;
pub mod services;
pub mod store;
pub mod streaming;

use chrono::Utc;
use config::Settings;
use middleware::{AddrRateLimiter, UserRateLimiter};
use rbac::PolicyEngine;
use services::TokenService;
use store::Store;
use streaming::{PermissionCache, StreamRegistry};

/// How long idle limiter buckets are kept before the sweeper may evict them.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub policy: Arc<PolicyEngine>,
    pub tokens: Arc<TokenService>,
    pub streams: Arc<StreamRegistry>,
    pub permission_cache: Arc<PermissionCache>,
    pub unauth_limiter: AddrRateLimiter,
    pub user_limiter: UserRateLimiter,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, store: Arc<Store>) -> Self {
        let unauth_limiter = AddrRateLimiter::new(
            settings.limits.unauth_requests_per_minute,
            LIMITER_SWEEP_INTERVAL,
        );
        let user_limiter = UserRateLimiter::new(
            settings.limits.user_requests_per_minute,
            LIMITER_SWEEP_INTERVAL,
        );
        let tokens = Arc::new(TokenService::new(
            settings.auth.access_token_ttl_secs,
            settings.auth.refresh_token_ttl_secs,
        ));
        AppState {
            settings,
            store,
            policy: Arc::new(PolicyEngine::new()),
            tokens,
            streams: StreamRegistry::new(),
            permission_cache: Arc::new(PermissionCache::new()),
            unauth_limiter,
            user_limiter,
        }
    }

    #[cfg(test)]
    pub async fn for_tests() -> Self {
        AppState::new(Arc::new(Settings::for_tests()), Store::new())
    }
}

/// Seed the store for a fresh process: builtin roles, the admin account and
/// this node's own record.
pub async fn seed(state: &AppState) -> anyhow::Result<()> {
    for role in rbac::builtin_roles() {
        if state.store.role_get(&role.name).await.is_none() {
            state.store.role_insert(role.clone()).await;
        }
        state.policy.sync_role(&role).await;
    }

    if state.store.user_get(&state.settings.admin.name).await.is_none() {
        let now = Utc::now();
        let admin = models::User {
            name: state.settings.admin.name.clone(),
            password_hash: bcrypt::hash(&state.settings.admin.password, bcrypt::DEFAULT_COST)?,
            roles: vec!["Administrator".to_string()],
            group: None,
            config: None,
            created_at: now,
            updated_at: now,
        };
        state.policy.sync_user_roles(&admin.name, &admin.roles).await;
        state.store.user_insert(admin).await;
        tracing::info!(name = %state.settings.admin.name, "Admin user seeded");
    }

    let now = Utc::now();
    state
        .store
        .node_register_this(models::Node {
            uid: uuid::Uuid::new_v4(),
            name: state.settings.node_name.clone(),
            address: format!("{}:{}", state.settings.server.host, state.settings.server.port),
            maintenance: false,
            created_at: now,
            updated_at: now,
        })
        .await;

    Ok(())
}
