use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(handlers::auth::login))
        .route("/refresh_token", post(handlers::auth::refresh_token))
        .route("/validate_token", post(handlers::auth::validate_token))
        .route("/get_permissions", post(handlers::auth::get_permissions))
}
