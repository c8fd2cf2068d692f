use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use validator::Validate;

use crate::error::ApiError;
use crate::models::{User, UserConfig};
use crate::rbac::{self, PolicyEngine};
use crate::store::Store;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub group: Option<String>,
    pub config: Option<UserConfig>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(min = 8, max = 128))]
    pub password: Option<String>,
    pub roles: Option<Vec<String>>,
    pub config: Option<UserConfig>,
}

pub struct UserService {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
}

impl UserService {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyEngine>) -> Self {
        Self { store, policy }
    }

    pub async fn list(&self) -> Vec<User> {
        self.store.user_list().await
    }

    pub async fn get(&self, name: &str) -> Result<User, ApiError> {
        self.store
            .user_get(name)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("user {} not found", name)))
    }

    pub async fn create(&self, request: CreateUserRequest) -> Result<User, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        for role in &request.roles {
            if self.store.role_get(role).await.is_none() {
                return Err(ApiError::InvalidArgument(format!("unknown role {}", role)));
            }
        }

        let now = Utc::now();
        let user = User {
            name: request.name,
            password_hash: bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)?,
            roles: request.roles,
            group: request.group,
            config: request.config,
            created_at: now,
            updated_at: now,
        };
        if !self.store.user_insert(user.clone()).await {
            return Err(ApiError::AlreadyExists(format!(
                "user {} already exists",
                user.name
            )));
        }
        self.policy.sync_user_roles(&user.name, &user.roles).await;
        tracing::info!(name = %user.name, "User created");
        Ok(user)
    }

    /// Self-service updates are always allowed; touching another user
    /// requires the elevated `update_all` grant.
    pub async fn update(
        &self,
        caller: &User,
        request: UpdateUserRequest,
    ) -> Result<User, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        if request.name != caller.name {
            let elevated = self
                .policy
                .check_permission(
                    &caller.roles,
                    rbac::services::USER,
                    &rbac::all_variant("update"),
                )
                .await;
            if !elevated {
                return Err(ApiError::PermissionDenied(
                    "cannot modify another user".to_string(),
                ));
            }
        }

        let mut user = self.get(&request.name).await?;
        if let Some(password) = request.password {
            user.password_hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;
        }
        if let Some(roles) = request.roles {
            for role in &roles {
                if self.store.role_get(role).await.is_none() {
                    return Err(ApiError::InvalidArgument(format!("unknown role {}", role)));
                }
            }
            user.roles = roles;
        }
        if let Some(config) = request.config {
            user.config = Some(config);
        }
        user.updated_at = Utc::now();
        self.store.user_update(user.clone()).await;
        self.policy.sync_user_roles(&user.name, &user.roles).await;
        Ok(user)
    }

    pub async fn remove(&self, name: &str) -> Result<User, ApiError> {
        let removed = self
            .store
            .user_remove(name)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("user {} not found", name)))?;
        self.policy.sync_user_roles(name, &[]).await;
        tracing::info!(name = %name, "User removed");
        Ok(removed)
    }

    /// Credential check for the Basic scheme. With `disable_auth` any known
    /// user passes (test deployments only).
    pub async fn authenticate(
        &self,
        name: &str,
        password: &str,
        disable_auth: bool,
    ) -> Result<User, ApiError> {
        let user = self
            .store
            .user_with_config(name)
            .await
            .ok_or_else(|| ApiError::Unauthenticated("unknown user".to_string()))?;
        if disable_auth {
            return Ok(user);
        }
        let valid = bcrypt::verify(password, &user.password_hash).unwrap_or(false);
        if valid {
            Ok(user)
        } else {
            Err(ApiError::Unauthenticated("invalid credentials".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Permission, Role};

    async fn fixture() -> (Arc<Store>, Arc<PolicyEngine>, UserService) {
        let store = Store::new();
        let policy = Arc::new(PolicyEngine::new());
        for role in rbac::builtin_roles() {
            store.role_insert(role.clone()).await;
            policy.sync_role(&role).await;
        }
        let service = UserService::new(store.clone(), policy.clone());
        (store, policy, service)
    }

    fn create_request(name: &str) -> CreateUserRequest {
        CreateUserRequest {
            name: name.to_string(),
            password: "correct-horse".to_string(),
            roles: vec!["User".to_string()],
            group: None,
            config: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let (_store, _policy, service) = fixture().await;
        service.create(create_request("alice")).await.unwrap();

        assert!(service
            .authenticate("alice", "correct-horse", false)
            .await
            .is_ok());
        assert!(service
            .authenticate("alice", "wrong", false)
            .await
            .is_err());
        assert!(service
            .authenticate("alice", "wrong", true)
            .await
            .is_ok());
        assert!(service
            .authenticate("nobody", "wrong", true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_create_already_exists() {
        let (_store, _policy, service) = fixture().await;
        service.create(create_request("alice")).await.unwrap();
        assert!(matches!(
            service.create(create_request("alice")).await,
            Err(ApiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_update_other_user_requires_elevation() {
        let (_store, policy, service) = fixture().await;
        service.create(create_request("alice")).await.unwrap();
        let bob = service.create(create_request("bob")).await.unwrap();

        let request = || UpdateUserRequest {
            name: "alice".to_string(),
            password: None,
            roles: None,
            config: Some(UserConfig {
                streams_limit: Some(3),
                requests_per_minute: None,
            }),
        };

        assert!(matches!(
            service.update(&bob, request()).await,
            Err(ApiError::PermissionDenied(_))
        ));

        policy
            .sync_role(&Role {
                name: "UserAdmin".to_string(),
                permissions: vec![Permission {
                    resource: rbac::services::USER.to_string(),
                    action: "update_all".to_string(),
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        let mut elevated_bob = bob.clone();
        elevated_bob.roles = vec!["UserAdmin".to_string()];
        assert!(service.update(&elevated_bob, request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_role_is_invalid() {
        let (_store, _policy, service) = fixture().await;
        let mut request = create_request("alice");
        request.roles = vec!["DoesNotExist".to_string()];
        assert!(matches!(
            service.create(request).await,
            Err(ApiError::InvalidArgument(_))
        ));
    }
}
