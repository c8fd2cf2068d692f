use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::models::Label;
use crate::store::Store;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLabelRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(range(min = 1))]
    pub version: u32,
    #[serde(default)]
    pub definitions: serde_json::Value,
}

pub struct LabelService {
    store: Arc<Store>,
}

impl LabelService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Vec<Label> {
        self.store.label_list().await
    }

    pub async fn get(&self, uid: Uuid) -> Result<Label, ApiError> {
        self.store
            .label_get(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("label {} not found", uid)))
    }

    /// Labels are immutable: a `(name, version)` pair can exist only once.
    pub async fn create(&self, request: CreateLabelRequest) -> Result<Label, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        if self
            .store
            .label_find_version(&request.name, request.version)
            .await
            .is_some()
        {
            return Err(ApiError::AlreadyExists(format!(
                "label {} version {} already exists",
                request.name, request.version
            )));
        }

        let label = Label {
            uid: Uuid::new_v4(),
            name: request.name,
            version: request.version,
            definitions: request.definitions,
            created_at: Utc::now(),
        };
        self.store.label_insert(label.clone()).await;
        tracing::info!(uid = %label.uid, name = %label.name, version = label.version, "Label created");
        Ok(label)
    }

    pub async fn remove(&self, uid: Uuid) -> Result<Label, ApiError> {
        if self.store.label_get(uid).await.is_none() {
            return Err(ApiError::NotFound(format!("label {} not found", uid)));
        }
        if self.store.label_in_use(uid).await {
            return Err(ApiError::InvalidArgument(
                "label is referenced by existing applications".to_string(),
            ));
        }
        self.store
            .label_remove(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("label {} not found", uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_version_is_rejected() {
        let service = LabelService::new(Store::new());
        let request = |v| CreateLabelRequest {
            name: "ubuntu".to_string(),
            version: v,
            definitions: serde_json::Value::Null,
        };

        service.create(request(1)).await.unwrap();
        assert!(matches!(
            service.create(request(1)).await,
            Err(ApiError::AlreadyExists(_))
        ));
        // A new version of the same name is fine.
        service.create(request(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let service = LabelService::new(Store::new());
        assert!(matches!(
            service.remove(Uuid::new_v4()).await,
            Err(ApiError::NotFound(_))
        ));
    }
}
