use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::models::{
    Application, ApplicationResource, ApplicationState, ApplicationStatus, ApplicationTask, User,
};
use crate::rbac::{self, PolicyEngine};
use crate::store::Store;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateApplicationRequest {
    pub label_uid: Uuid,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskRequest {
    pub application_uid: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub task: String,
    pub when: Option<ApplicationStatus>,
    #[serde(default)]
    pub options: serde_json::Value,
}

pub struct ApplicationService {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
}

impl ApplicationService {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyEngine>) -> Self {
        Self { store, policy }
    }

    /// Elevated check: does the user hold the `*_all` variant of `method`?
    async fn holds_all(&self, user: &User, method: &str) -> bool {
        self.policy
            .check_permission(&user.roles, rbac::services::APPLICATION, &rbac::all_variant(method))
            .await
    }

    /// Fetch the application and enforce owner-or-elevated visibility.
    async fn visible_application(
        &self,
        user: &User,
        uid: Uuid,
        method: &str,
    ) -> Result<Application, ApiError> {
        let app = self
            .store
            .application_get(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("application {} not found", uid)))?;
        if app.owner_name == user.name || self.holds_all(user, method).await {
            Ok(app)
        } else {
            Err(ApiError::PermissionDenied(
                "application belongs to another user".to_string(),
            ))
        }
    }

    /// List the caller's applications, or everyone's with `list_all`.
    pub async fn list(&self, user: &User) -> Result<Vec<Application>, ApiError> {
        let all = self.holds_all(user, "list").await;
        let apps = self
            .store
            .application_list()
            .await
            .into_iter()
            .filter(|a| all || a.owner_name == user.name)
            .collect();
        Ok(apps)
    }

    pub async fn get(&self, user: &User, uid: Uuid) -> Result<Application, ApiError> {
        self.visible_application(user, uid, "get").await
    }

    pub async fn create(
        &self,
        user: &User,
        request: CreateApplicationRequest,
    ) -> Result<Application, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

        if self.store.label_get(request.label_uid).await.is_none() {
            return Err(ApiError::NotFound(format!(
                "label {} not found",
                request.label_uid
            )));
        }

        let app = Application {
            uid: Uuid::new_v4(),
            owner_name: user.name.clone(),
            label_uid: request.label_uid,
            metadata: request.metadata,
            created_at: Utc::now(),
        };
        self.store.application_insert(app.clone()).await;
        self.policy
            .add_ownership(&user.name, &app.uid.to_string())
            .await;
        self.store
            .application_state_push(ApplicationState {
                application_uid: app.uid,
                status: ApplicationStatus::New,
                description: "created".to_string(),
                created_at: Utc::now(),
            })
            .await;

        tracing::info!(uid = %app.uid, owner = %user.name, "Application created");
        Ok(app)
    }

    pub async fn get_state(&self, user: &User, uid: Uuid) -> Result<ApplicationState, ApiError> {
        self.visible_application(user, uid, "get_state").await?;
        self.store
            .application_state_latest(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("no state for application {}", uid)))
    }

    pub async fn get_resource(
        &self,
        user: &User,
        uid: Uuid,
    ) -> Result<ApplicationResource, ApiError> {
        self.visible_application(user, uid, "get_resource").await?;
        self.store
            .application_resource_for(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("no resource for application {}", uid)))
    }

    pub async fn list_task(&self, user: &User, uid: Uuid) -> Result<Vec<ApplicationTask>, ApiError> {
        self.visible_application(user, uid, "list_task").await?;
        Ok(self.store.application_task_list(uid).await)
    }

    pub async fn create_task(
        &self,
        user: &User,
        request: CreateTaskRequest,
    ) -> Result<ApplicationTask, ApiError> {
        request
            .validate()
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        self.visible_application(user, request.application_uid, "create_task")
            .await?;

        let task = ApplicationTask {
            uid: Uuid::new_v4(),
            application_uid: request.application_uid,
            task: request.task,
            when: request.when.unwrap_or(ApplicationStatus::Allocated),
            options: request.options,
            result: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        self.store.application_task_insert(task.clone()).await;
        Ok(task)
    }

    pub async fn get_task(&self, user: &User, task_uid: Uuid) -> Result<ApplicationTask, ApiError> {
        let task = self
            .store
            .application_task_get(task_uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("task {} not found", task_uid)))?;
        self.visible_application(user, task.application_uid, "get_task")
            .await?;
        Ok(task)
    }

    /// Move the application toward DEALLOCATED, releasing its resource.
    pub async fn deallocate(&self, user: &User, uid: Uuid) -> Result<ApplicationState, ApiError> {
        self.visible_application(user, uid, "deallocate").await?;

        let current = self
            .store
            .application_state_latest(uid)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("no state for application {}", uid)))?;
        if current.status.is_terminal() {
            return Err(ApiError::InvalidArgument(format!(
                "application is already {}",
                current.status
            )));
        }

        self.store.application_resource_remove(uid).await;
        self.policy.remove_ownership(&uid.to_string()).await;

        let state = ApplicationState {
            application_uid: uid,
            status: ApplicationStatus::Deallocated,
            description: "deallocated by user request".to_string(),
            created_at: Utc::now(),
        };
        self.store.application_state_push(state.clone()).await;
        tracing::info!(uid = %uid, "Application deallocated");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Label, Permission, Role, UserConfig};

    async fn fixture() -> (Arc<Store>, Arc<PolicyEngine>, ApplicationService, Uuid) {
        let store = Store::new();
        let policy = Arc::new(PolicyEngine::new());
        let label_uid = Uuid::new_v4();
        store
            .label_insert(Label {
                uid: label_uid,
                name: "ubuntu".to_string(),
                version: 1,
                definitions: serde_json::Value::Null,
                created_at: Utc::now(),
            })
            .await;
        let service = ApplicationService::new(store.clone(), policy.clone());
        (store, policy, service, label_uid)
    }

    fn user(name: &str, roles: &[&str]) -> User {
        User {
            name: name.to_string(),
            password_hash: String::new(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            group: None,
            config: Some(UserConfig::default()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_pushes_new_state() {
        let (store, _policy, service, label_uid) = fixture().await;
        let alice = user("alice", &["User"]);

        let app = service
            .create(
                &alice,
                CreateApplicationRequest {
                    label_uid,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        let state = store.application_state_latest(app.uid).await.unwrap();
        assert_eq!(state.status, ApplicationStatus::New);
        assert_eq!(app.owner_name, "alice");
    }

    #[tokio::test]
    async fn test_create_with_unknown_label_is_not_found() {
        let (_store, _policy, service, _label_uid) = fixture().await;
        let result = service
            .create(
                &user("alice", &["User"]),
                CreateApplicationRequest {
                    label_uid: Uuid::new_v4(),
                    metadata: serde_json::Value::Null,
                },
            )
            .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_non_owner_is_denied_without_elevation() {
        let (_store, policy, service, label_uid) = fixture().await;
        let alice = user("alice", &["User"]);
        let bob = user("bob", &["User"]);

        let app = service
            .create(
                &alice,
                CreateApplicationRequest {
                    label_uid,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        let denied = service.get_state(&bob, app.uid).await;
        assert!(matches!(denied, Err(ApiError::PermissionDenied(_))));

        // Grant the elevated variant and retry.
        policy
            .sync_role(&Role {
                name: "Observer".to_string(),
                permissions: vec![Permission {
                    resource: rbac::services::APPLICATION.to_string(),
                    action: "get_state_all".to_string(),
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        let observer = user("bob", &["Observer"]);
        assert!(service.get_state(&observer, app.uid).await.is_ok());
    }

    #[tokio::test]
    async fn test_deallocate_twice_is_invalid() {
        let (_store, _policy, service, label_uid) = fixture().await;
        let alice = user("alice", &["User"]);
        let app = service
            .create(
                &alice,
                CreateApplicationRequest {
                    label_uid,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        let state = service.deallocate(&alice, app.uid).await.unwrap();
        assert_eq!(state.status, ApplicationStatus::Deallocated);

        let again = service.deallocate(&alice, app.uid).await;
        assert!(matches!(again, Err(ApiError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_list_scopes_to_owner() {
        let (_store, _policy, service, label_uid) = fixture().await;
        let alice = user("alice", &["User"]);
        let bob = user("bob", &["User"]);
        service
            .create(
                &alice,
                CreateApplicationRequest {
                    label_uid,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        assert_eq!(service.list(&alice).await.unwrap().len(), 1);
        assert!(service.list(&bob).await.unwrap().is_empty());
    }
}
