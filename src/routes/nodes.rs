use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/list", post(handlers::nodes::list))
        .route("/get_this", post(handlers::nodes::get_this))
        .route("/set_maintenance", post(handlers::nodes::set_maintenance))
}
