use axum::{extract::State, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::models::Role;
use crate::services::role_service::RoleRequest;
use crate::services::RoleService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RoleRef {
    pub name: String,
}

fn service(state: &AppState) -> RoleService {
    RoleService::new(state.store.clone(), state.policy.clone())
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Role>> {
    Json(service(&state).list().await)
}

pub async fn get(
    State(state): State<AppState>,
    Json(request): Json<RoleRef>,
) -> Result<Json<Role>, ApiError> {
    Ok(Json(service(&state).get(&request.name).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<RoleRequest>,
) -> Result<Json<Role>, ApiError> {
    Ok(Json(service(&state).create(request).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Json(request): Json<RoleRequest>,
) -> Result<Json<Role>, ApiError> {
    Ok(Json(service(&state).update(request).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(request): Json<RoleRef>,
) -> Result<Json<Role>, ApiError> {
    Ok(Json(service(&state).delete(&request.name).await?))
}
