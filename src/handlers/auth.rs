use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::extractors::CurrentUser;
use crate::models::{Permission, User};
use crate::services::UserService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTokenRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct TokenValidity {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Best-effort client address for the unauth limiter on login failures;
/// the middleware variant is not in play because login is auth-exempt.
fn client_addr(headers: &HeaderMap) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<std::net::IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }
    "127.0.0.1".to_string()
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let users = UserService::new(state.store.clone(), state.policy.clone());
    let user = match users
        .authenticate(
            &request.user,
            &request.password,
            state.settings.auth.disable_auth,
        )
        .await
    {
        Ok(user) => user,
        Err(err) => {
            let addr = client_addr(&headers);
            if !state.unauth_limiter.allow(&addr).await {
                return Err(ApiError::ResourceExhausted(
                    "too many unauthenticated requests".to_string(),
                ));
            }
            return Err(err);
        }
    };

    tracing::info!(user = %user.name, "Login");
    Ok(Json(TokenPair {
        access_token: state.tokens.issue_access(&user)?,
        refresh_token: state.tokens.issue_refresh(&user)?,
        user,
    }))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let claims = state.tokens.verify_refresh(&request.refresh_token)?;
    let user = state
        .store
        .user_with_config(&claims.user_name)
        .await
        .ok_or_else(|| ApiError::Unauthenticated("unknown user".to_string()))?;

    Ok(Json(TokenPair {
        access_token: state.tokens.issue_access(&user)?,
        refresh_token: state.tokens.issue_refresh(&user)?,
        user,
    }))
}

pub async fn validate_token(
    State(state): State<AppState>,
    _caller: CurrentUser,
    Json(request): Json<ValidateTokenRequest>,
) -> Json<TokenValidity> {
    match state.tokens.verify_access(&request.token) {
        Ok(claims) => Json(TokenValidity {
            valid: true,
            user_name: Some(claims.user_name),
        }),
        Err(_) => Json(TokenValidity {
            valid: false,
            user_name: None,
        }),
    }
}

pub async fn get_permissions(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Json<Vec<Permission>> {
    Json(state.policy.permissions_for(&user.roles).await)
}
