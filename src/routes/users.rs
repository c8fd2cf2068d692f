use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/get_me", post(handlers::users::get_me))
        .route("/list", post(handlers::users::list))
        .route("/get", post(handlers::users::get))
        .route("/create", post(handlers::users::create))
        .route("/update", post(handlers::users::update))
        .route("/remove", post(handlers::users::remove))
}
