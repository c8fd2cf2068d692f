use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/list", post(handlers::roles::list))
        .route("/get", post(handlers::roles::get))
        .route("/create", post(handlers::roles::create))
        .route("/update", post(handlers::roles::update))
        .route("/delete", post(handlers::roles::delete))
}
