use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/list", post(handlers::applications::list))
        .route("/get", post(handlers::applications::get))
        .route("/create", post(handlers::applications::create))
        .route("/get_state", post(handlers::applications::get_state))
        .route("/get_resource", post(handlers::applications::get_resource))
        .route("/list_task", post(handlers::applications::list_task))
        .route("/create_task", post(handlers::applications::create_task))
        .route("/get_task", post(handlers::applications::get_task))
        .route("/deallocate", post(handlers::applications::deallocate))
}
