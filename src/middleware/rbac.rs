//! RBAC gate.
//!
//! Resolves the procedure path to `(service, method)`, checks the policy for
//! the authenticated user's roles and attaches the resolved [`RbacScope`] to
//! the request. Handlers re-query the policy through that scope with
//! elevated method names (`list_all`, `get_state_all`, …).

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::extractors::{CurrentUser, RbacScope};
use crate::rbac;
use crate::AppState;

pub async fn rbac_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some((service, method)) = rbac::resolve_path(request.uri().path()) else {
        return next.run(request).await;
    };

    if rbac::is_rbac_exempt(service, &method) {
        request.extensions_mut().insert(RbacScope { service, method });
        return next.run(request).await;
    }

    let Some(CurrentUser(user)) = request.extensions().get::<CurrentUser>().cloned() else {
        return ApiError::Unauthenticated("authentication required".to_string()).into_response();
    };

    if !state
        .policy
        .check_permission(&user.roles, service, &method)
        .await
    {
        tracing::debug!(user = %user.name, service = %service, method = %method, "RBAC deny");
        return ApiError::PermissionDenied(format!("no access to {}/{}", service, method))
            .into_response();
    }

    request.extensions_mut().insert(RbacScope { service, method });
    next.run(request).await
}
