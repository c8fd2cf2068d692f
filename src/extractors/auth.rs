use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use crate::models::User;

/// The authenticated user, populated by the credential gate.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthenticated("authentication required".to_string()))
    }
}

/// The resolved `(service, method)` pair, populated by the RBAC gate.
/// Handlers re-query the policy with elevated method names through this.
#[derive(Debug, Clone)]
pub struct RbacScope {
    pub service: &'static str,
    pub method: String,
}

impl<S> FromRequestParts<S> for RbacScope
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RbacScope>()
            .cloned()
            .ok_or_else(|| ApiError::Internal("rbac scope missing from request".to_string()))
    }
}
