use axum::{extract::State, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::extractors::CurrentUser;
use crate::models::{
    Application, ApplicationResource, ApplicationState, ApplicationTask,
};
use crate::services::application_service::{CreateApplicationRequest, CreateTaskRequest};
use crate::services::ApplicationService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ApplicationRef {
    pub application_uid: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TaskRef {
    pub task_uid: Uuid,
}

fn service(state: &AppState) -> ApplicationService {
    ApplicationService::new(state.store.clone(), state.policy.clone())
}

pub async fn list(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<Application>>, ApiError> {
    Ok(Json(service(&state).list(&user).await?))
}

pub async fn get(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplicationRef>,
) -> Result<Json<Application>, ApiError> {
    Ok(Json(service(&state).get(&user, request.application_uid).await?))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateApplicationRequest>,
) -> Result<Json<Application>, ApiError> {
    Ok(Json(service(&state).create(&user, request).await?))
}

pub async fn get_state(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplicationRef>,
) -> Result<Json<ApplicationState>, ApiError> {
    Ok(Json(
        service(&state)
            .get_state(&user, request.application_uid)
            .await?,
    ))
}

pub async fn get_resource(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplicationRef>,
) -> Result<Json<ApplicationResource>, ApiError> {
    Ok(Json(
        service(&state)
            .get_resource(&user, request.application_uid)
            .await?,
    ))
}

pub async fn list_task(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplicationRef>,
) -> Result<Json<Vec<ApplicationTask>>, ApiError> {
    Ok(Json(
        service(&state)
            .list_task(&user, request.application_uid)
            .await?,
    ))
}

pub async fn create_task(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<ApplicationTask>, ApiError> {
    Ok(Json(service(&state).create_task(&user, request).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<TaskRef>,
) -> Result<Json<ApplicationTask>, ApiError> {
    Ok(Json(service(&state).get_task(&user, request.task_uid).await?))
}

pub async fn deallocate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ApplicationRef>,
) -> Result<Json<ApplicationState>, ApiError> {
    Ok(Json(
        service(&state)
            .deallocate(&user, request.application_uid)
            .await?,
    ))
}
