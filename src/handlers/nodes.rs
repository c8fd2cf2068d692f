use axum::{extract::State, Json};

use crate::error::ApiError;
use crate::models::Node;
use crate::services::node_service::SetMaintenanceRequest;
use crate::services::NodeService;
use crate::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(NodeService::new(state.store.clone()).list().await)
}

pub async fn get_this(State(state): State<AppState>) -> Result<Json<Node>, ApiError> {
    Ok(Json(NodeService::new(state.store.clone()).get_this().await?))
}

pub async fn set_maintenance(
    State(state): State<AppState>,
    Json(request): Json<SetMaintenanceRequest>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(
        NodeService::new(state.store.clone())
            .set_maintenance(request)
            .await?,
    ))
}
