use axum::{routing::get, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connect", get(handlers::streaming::connect))
        .route("/subscribe", get(handlers::streaming::subscribe))
}
