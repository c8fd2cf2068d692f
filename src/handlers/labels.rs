use axum::{extract::State, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Label;
use crate::services::label_service::CreateLabelRequest;
use crate::services::LabelService;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LabelRef {
    pub label_uid: Uuid,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Label>> {
    Json(LabelService::new(state.store.clone()).list().await)
}

pub async fn get(
    State(state): State<AppState>,
    Json(request): Json<LabelRef>,
) -> Result<Json<Label>, ApiError> {
    Ok(Json(
        LabelService::new(state.store.clone())
            .get(request.label_uid)
            .await?,
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateLabelRequest>,
) -> Result<Json<Label>, ApiError> {
    Ok(Json(
        LabelService::new(state.store.clone()).create(request).await?,
    ))
}

pub async fn remove(
    State(state): State<AppState>,
    Json(request): Json<LabelRef>,
) -> Result<Json<Label>, ApiError> {
    Ok(Json(
        LabelService::new(state.store.clone())
            .remove(request.label_uid)
            .await?,
    ))
}
