use axum::{extract::State, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::extractors::CurrentUser;
use crate::models::User;
use crate::services::user_service::{CreateUserRequest, UpdateUserRequest};
use crate::services::UserService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UserRef {
    pub name: String,
}

fn service(state: &AppState) -> UserService {
    UserService::new(state.store.clone(), state.policy.clone())
}

pub async fn get_me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<User>> {
    Json(service(&state).list().await)
}

pub async fn get(
    State(state): State<AppState>,
    Json(request): Json<UserRef>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(service(&state).get(&request.name).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(service(&state).create(request).await?))
}

pub async fn update(
    State(state): State<AppState>,
    CurrentUser(caller): CurrentUser,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(service(&state).update(&caller, request).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    Json(request): Json<UserRef>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(service(&state).remove(&request.name).await?))
}
