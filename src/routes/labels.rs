use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/list", post(handlers::labels::list))
        .route("/get", post(handlers::labels::get))
        .route("/create", post(handlers::labels::create))
        .route("/remove", post(handlers::labels::remove))
}
