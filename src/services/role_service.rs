use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use validator::Validate;

use crate::error::ApiError;
use crate::models::{Permission, Role};
use crate::rbac::PolicyEngine;
use crate::store::Store;

#[derive(Debug, Deserialize, Validate)]
pub struct RoleRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

pub struct RoleService {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
}

impl RoleService {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyEngine>) -> Self {
        Self { store, policy }
    }

    pub async fn list(&self) -> Vec<Role> {
        self.store.role_list().await
    }

    pub async fn get(&self, name: &str) -> Result<Role, ApiError> {
        self.store
            .role_get(name)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("role {} not found", name)))
    }

    pub async fn create(&self, request: RoleRequest) -> Result<Role, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        let now = Utc::now();
        let role = Role {
            name: request.name,
            permissions: request.permissions,
            created_at: now,
            updated_at: now,
        };
        if !self.store.role_insert(role.clone()).await {
            return Err(ApiError::AlreadyExists(format!(
                "role {} already exists",
                role.name
            )));
        }
        self.policy.sync_role(&role).await;
        tracing::info!(name = %role.name, "Role created");
        Ok(role)
    }

    pub async fn update(&self, request: RoleRequest) -> Result<Role, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        let mut role = self.get(&request.name).await?;
        role.permissions = request.permissions;
        role.updated_at = Utc::now();
        self.store.role_update(role.clone()).await;
        self.policy.sync_role(&role).await;
        Ok(role)
    }

    pub async fn delete(&self, name: &str) -> Result<Role, ApiError> {
        let removed = self
            .store
            .role_remove(name)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("role {} not found", name)))?;
        self.policy.remove_role(name).await;
        tracing::info!(name = %name, "Role deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::services;

    #[tokio::test]
    async fn test_role_mutations_sync_policy() {
        let store = Store::new();
        let policy = Arc::new(PolicyEngine::new());
        let service = RoleService::new(store, policy.clone());
        let roles = vec!["Deployer".to_string()];

        service
            .create(RoleRequest {
                name: "Deployer".to_string(),
                permissions: vec![Permission {
                    resource: services::APPLICATION.to_string(),
                    action: "create".to_string(),
                }],
            })
            .await
            .unwrap();
        assert!(
            policy
                .check_permission(&roles, services::APPLICATION, "create")
                .await
        );

        service
            .update(RoleRequest {
                name: "Deployer".to_string(),
                permissions: vec![],
            })
            .await
            .unwrap();
        assert!(
            !policy
                .check_permission(&roles, services::APPLICATION, "create")
                .await
        );

        service.delete("Deployer").await.unwrap();
        assert!(matches!(
            service.get("Deployer").await,
            Err(ApiError::NotFound(_))
        ));
    }
}
