//! Credential gate.
//!
//! Decodes `Basic` or `Bearer` credentials, resolves the user in the store,
//! enriches it with group configuration and attaches it to the request as a
//! [`CurrentUser`] extension. On failure the per-address unauth limiter is
//! consulted: within budget the response is `401`, beyond it `429`.
//!
//! Requests whose `(service, method)` pair is on the auth-exempt list pass
//! through untouched (login and token refresh must work without a session).

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;

use crate::error::ApiError;
use crate::extractors::CurrentUser;
use crate::middleware::rate_limit::extract_client_addr;
use crate::models::User;
use crate::rbac;
use crate::services::UserService;
use crate::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some((service, method)) = rbac::resolve_path(request.uri().path()) {
        if rbac::is_auth_exempt(service, &method) {
            return next.run(request).await;
        }
    } else {
        // Non-procedure paths (health) carry no credentials.
        return next.run(request).await;
    }

    match authenticate(&state, &request).await {
        Ok(user) => {
            request.extensions_mut().insert(CurrentUser(user));
            next.run(request).await
        }
        Err(err) => {
            let addr = extract_client_addr(&request);
            if state.unauth_limiter.allow(&addr).await {
                tracing::debug!(addr = %addr, "Authentication failed: {}", err);
                err.into_response()
            } else {
                tracing::warn!(addr = %addr, "Unauthenticated traffic rate-limited");
                ApiError::ResourceExhausted("too many unauthenticated requests".to_string())
                    .into_response()
            }
        }
    }
}

async fn authenticate(state: &AppState, request: &Request) -> Result<User, ApiError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthenticated("missing authorization header".to_string()))?;

    if let Some(token) = header_value.strip_prefix("Bearer ") {
        let claims = state.tokens.verify_access(token.trim())?;
        return state
            .store
            .user_with_config(&claims.user_name)
            .await
            .ok_or_else(|| ApiError::Unauthenticated("unknown user".to_string()));
    }

    if let Some(encoded) = header_value.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| ApiError::Unauthenticated("malformed basic credentials".to_string()))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| ApiError::Unauthenticated("malformed basic credentials".to_string()))?;
        let (name, password) = text
            .split_once(':')
            .ok_or_else(|| ApiError::Unauthenticated("malformed basic credentials".to_string()))?;

        let users = UserService::new(state.store.clone(), state.policy.clone());
        return users
            .authenticate(name, password, state.settings.auth.disable_auth)
            .await;
    }

    Err(ApiError::Unauthenticated(
        "unsupported authorization scheme".to_string(),
    ))
}

/// Per-user limiter, applied after the credential gate. Unauthenticated
/// requests (exempt paths) pass through; they are covered by the address
/// limiter on auth failure instead.
pub async fn user_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(CurrentUser(user)) = request.extensions().get::<CurrentUser>() {
        let override_rpm = user.config.as_ref().and_then(|c| c.requests_per_minute);
        let allowed = state.user_limiter.allow(&user.name, override_rpm).await;
        if !allowed {
            tracing::debug!(user = %user.name, "User rate limit exceeded");
            return ApiError::ResourceExhausted("rate limit exceeded".to_string()).into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware::from_fn_with_state,
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    use crate::handlers;
    use crate::services::user_service::CreateUserRequest;

    async fn state_with_alice() -> AppState {
        let state = AppState::for_tests().await;
        for role in rbac::builtin_roles() {
            state.store.role_insert(role.clone()).await;
            state.policy.sync_role(&role).await;
        }
        UserService::new(state.store.clone(), state.policy.clone())
            .create(CreateUserRequest {
                name: "alice".to_string(),
                password: "correct-horse".to_string(),
                roles: vec!["User".to_string()],
                group: None,
                config: None,
            })
            .await
            .unwrap();
        state
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/api/user/get_me", post(handlers::users::get_me))
            .layer(from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state)
    }

    fn basic(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password))
        )
    }

    fn get_me(authorization: &str) -> HttpRequest<Body> {
        HttpRequest::post("/api/user/get_me")
            .header("authorization", authorization)
            .header("x-forwarded-for", "9.9.9.9")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_basic_credentials_authenticate() {
        let app = app(state_with_alice().await);
        let response = app
            .oneshot(get_me(&basic("alice", "correct-horse")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bearer_token_authenticates() {
        let state = state_with_alice().await;
        let alice = state.store.user_get("alice").await.unwrap();
        let token = state.tokens.issue_access(&alice).unwrap();
        let app = app(state);

        let response = app
            .oneshot(get_me(&format!("Bearer {}", token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_eleventh_bad_request_from_one_address_is_throttled() {
        let app = app(state_with_alice().await);

        for i in 0..10 {
            let response = app
                .clone()
                .oneshot(get_me(&basic("alice", "wrong-password")))
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "request {} should be 401",
                i + 1
            );
        }

        let response = app
            .oneshot(get_me(&basic("alice", "wrong-password")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_missing_header_is_unauthenticated() {
        let app = app(state_with_alice().await);
        let request = HttpRequest::post("/api/user/get_me")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
