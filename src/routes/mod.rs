use std::time::Duration;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use tower_http::timeout::TimeoutLayer;

use crate::{
    middleware::{
        auth_middleware, rbac_middleware, request_id_middleware, user_rate_limit,
        yaml_body_middleware,
    },
    AppState,
};

pub mod applications;
pub mod auth;
mod health;
pub mod labels;
pub mod nodes;
pub mod roles;
pub mod streaming;
pub mod users;

/// Build all API routes with the full gate stack.
///
/// Request flow, outermost first:
///
///   request-id → credential gate (consults the unauth limiter on failure)
///   → per-user limiter → RBAC gate → then, on unary procedure routes only,
///   the YAML normalizer and the default 10-second deadline.
///
/// Streaming routes skip the normalizer and the deadline: a Connect or
/// Subscribe stream lives until one side hangs up.
pub fn api_routes(state: AppState) -> Router<AppState> {
    let unary = Router::new()
        .nest("/application", applications::routes())
        .nest("/label", labels::routes())
        .nest("/node", nodes::routes())
        .nest("/user", users::routes())
        .nest("/role", roles::routes())
        .nest("/auth", auth::routes())
        .layer(from_fn(yaml_body_middleware))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.settings.server.request_timeout_secs,
        )));

    let streaming = Router::new().nest("/stream", streaming::routes());

    Router::new()
        .merge(unary)
        .merge(streaming)
        .route("/health", get(health::health_check))
        .layer(from_fn_with_state(state.clone(), rbac_middleware))
        .layer(from_fn_with_state(state.clone(), user_rate_limit))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn(request_id_middleware))
}
