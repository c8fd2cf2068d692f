//! Role-based access control.
//!
//! The policy engine holds three disjoint rule sequences:
//!   1. policy triples `(subject, object, action)` – flattened from Role
//!      records, `*` wildcards allowed;
//!   2. role assignments `(user, role)` – mirrored from User records;
//!   3. ownership assignments `(user, resource_uid)` – bookkeeping written on
//!      application create/remove. Never consulted by `check_permission`;
//!      per-event ownership derives from the Application record itself.
//!
//! Procedure resolution (HTTP path or stream `request_type` → service short
//! name + method) lives here too, so the middleware, the multiplexer and the
//! subscription pre-checks all share one table.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::models::{ObjectKind, Permission, Role};

pub mod services {
    pub const APPLICATION: &str = "ApplicationService";
    pub const LABEL: &str = "LabelService";
    pub const NODE: &str = "NodeService";
    pub const USER: &str = "UserService";
    pub const ROLE: &str = "RoleService";
    pub const AUTH: &str = "AuthService";
    pub const STREAMING: &str = "StreamingService";
}

/// Requests where the credential gate steps aside entirely.
pub const AUTH_EXEMPT: &[(&str, &str)] = &[
    (services::AUTH, "login"),
    (services::AUTH, "refresh_token"),
];

/// Requests that skip the policy check (they still require authentication,
/// except where also listed in [`AUTH_EXEMPT`]).
pub const RBAC_EXEMPT: &[(&str, &str)] = &[
    (services::AUTH, "login"),
    (services::AUTH, "refresh_token"),
    (services::AUTH, "validate_token"),
    (services::AUTH, "get_permissions"),
    (services::USER, "get_me"),
];

pub fn is_auth_exempt(service: &str, method: &str) -> bool {
    AUTH_EXEMPT.iter().any(|(s, m)| *s == service && *m == method)
}

pub fn is_rbac_exempt(service: &str, method: &str) -> bool {
    RBAC_EXEMPT.iter().any(|(s, m)| *s == service && *m == method)
}

/// Resolve an HTTP procedure path `/api/<segment>/<method>` to
/// `(ServiceShortName, method)`.
pub fn resolve_path(path: &str) -> Option<(&'static str, String)> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "api" {
        return None;
    }
    let service = match segments.next()? {
        "application" => services::APPLICATION,
        "label" => services::LABEL,
        "node" => services::NODE,
        "user" => services::USER,
        "role" => services::ROLE,
        "auth" => services::AUTH,
        "stream" => services::STREAMING,
        _ => return None,
    };
    let method = segments.next()?;
    if method.is_empty() || segments.next().is_some() {
        return None;
    }
    Some((service, method.to_string()))
}

/// The `*_all` variant of a method name; authorizes the operation against
/// resources the caller does not own.
pub fn all_variant(method: &str) -> String {
    format!("{}_all", method)
}

/// Base subscribe permission for one object kind: the read method of the
/// owning service. The whole subscription is rejected if any requested kind
/// is denied.
pub fn subscribe_permission(kind: ObjectKind) -> Option<(&'static str, &'static str)> {
    match kind {
        ObjectKind::Application => Some((services::APPLICATION, "list")),
        ObjectKind::ApplicationState => Some((services::APPLICATION, "get_state")),
        ObjectKind::ApplicationTask => Some((services::APPLICATION, "list_task")),
        ObjectKind::ApplicationResource => Some((services::APPLICATION, "get_resource")),
        ObjectKind::Label => Some((services::LABEL, "list")),
        ObjectKind::Node => Some((services::NODE, "list")),
        ObjectKind::User => Some((services::USER, "list")),
        ObjectKind::Role => Some((services::ROLE, "list")),
        ObjectKind::UserGroup => Some((services::USER, "list")),
        ObjectKind::Unspecified => None,
    }
}

/// The elevated method that grants visibility into other users'
/// application-scoped events.
pub fn event_all_method(kind: ObjectKind) -> Option<(&'static str, &'static str)> {
    match kind {
        ObjectKind::Application => Some((services::APPLICATION, "list_all")),
        ObjectKind::ApplicationState => Some((services::APPLICATION, "get_state_all")),
        ObjectKind::ApplicationTask => Some((services::APPLICATION, "list_task_all")),
        ObjectKind::ApplicationResource => Some((services::APPLICATION, "get_resource_all")),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Policy engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub subject: String,
    pub object: String,
    pub action: String,
}

#[derive(Default)]
struct Rules {
    policies: Vec<PolicyRule>,
    role_assignments: Vec<(String, String)>,
    ownerships: Vec<(String, String)>,
}

pub struct PolicyEngine {
    rules: RwLock<Rules>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        PolicyEngine {
            rules: RwLock::new(Rules::default()),
        }
    }

    /// True if any of the roles matches a policy triple for
    /// `(service, method)`. `*` in a rule's object or action matches
    /// anything.
    pub async fn check_permission(&self, roles: &[String], service: &str, method: &str) -> bool {
        let rules = self.rules.read().await;
        rules.policies.iter().any(|p| {
            roles.iter().any(|r| *r == p.subject)
                && (p.object == "*" || p.object == service)
                && (p.action == "*" || p.action == method)
        })
    }

    /// Replace the policy triples derived from one role.
    pub async fn sync_role(&self, role: &Role) {
        let mut rules = self.rules.write().await;
        rules.policies.retain(|p| p.subject != role.name);
        for permission in &role.permissions {
            rules.policies.push(PolicyRule {
                subject: role.name.clone(),
                object: permission.resource.clone(),
                action: permission.action.clone(),
            });
        }
    }

    pub async fn remove_role(&self, role_name: &str) {
        let mut rules = self.rules.write().await;
        rules.policies.retain(|p| p.subject != role_name);
        rules.role_assignments.retain(|(_, r)| r != role_name);
    }

    /// Replace the `(user, role)` assignments for one user.
    pub async fn sync_user_roles(&self, user_name: &str, roles: &[String]) {
        let mut rules = self.rules.write().await;
        rules.role_assignments.retain(|(u, _)| u != user_name);
        for role in roles {
            rules
                .role_assignments
                .push((user_name.to_string(), role.clone()));
        }
    }

    pub async fn roles_of(&self, user_name: &str) -> Vec<String> {
        self.rules
            .read()
            .await
            .role_assignments
            .iter()
            .filter(|(u, _)| u == user_name)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Ownership bookkeeping; not consulted by permission checks.
    pub async fn add_ownership(&self, user_name: &str, resource_uid: &str) {
        self.rules
            .write()
            .await
            .ownerships
            .push((user_name.to_string(), resource_uid.to_string()));
    }

    pub async fn remove_ownership(&self, resource_uid: &str) {
        self.rules
            .write()
            .await
            .ownerships
            .retain(|(_, res)| res != resource_uid);
    }

    /// Flattened permissions across the given roles, for
    /// `AuthService/get_permissions`.
    pub async fn permissions_for(&self, roles: &[String]) -> Vec<Permission> {
        let rules = self.rules.read().await;
        let mut seen: HashMap<(String, String), ()> = HashMap::new();
        let mut out = Vec::new();
        for p in rules
            .policies
            .iter()
            .filter(|p| roles.iter().any(|r| *r == p.subject))
        {
            if seen
                .insert((p.object.clone(), p.action.clone()), ())
                .is_none()
            {
                out.push(Permission {
                    resource: p.object.clone(),
                    action: p.action.clone(),
                });
            }
        }
        out
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Roles every deployment starts with: a wildcard administrator and a
/// self-service user role.
pub fn builtin_roles() -> Vec<Role> {
    let now = chrono::Utc::now();
    vec![
        Role {
            name: "Administrator".to_string(),
            permissions: vec![Permission {
                resource: "*".to_string(),
                action: "*".to_string(),
            }],
            created_at: now,
            updated_at: now,
        },
        Role {
            name: "User".to_string(),
            permissions: [
                (services::APPLICATION, "list"),
                (services::APPLICATION, "get"),
                (services::APPLICATION, "create"),
                (services::APPLICATION, "get_state"),
                (services::APPLICATION, "get_resource"),
                (services::APPLICATION, "list_task"),
                (services::APPLICATION, "create_task"),
                (services::APPLICATION, "get_task"),
                (services::APPLICATION, "deallocate"),
                (services::LABEL, "list"),
                (services::LABEL, "get"),
                (services::NODE, "list"),
                (services::NODE, "get_this"),
                (services::STREAMING, "connect"),
                (services::STREAMING, "subscribe"),
            ]
            .iter()
            .map(|(resource, action)| Permission {
                resource: resource.to_string(),
                action: action.to_string(),
            })
            .collect(),
            created_at: now,
            updated_at: now,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn role(name: &str, perms: &[(&str, &str)]) -> Role {
        Role {
            name: name.to_string(),
            permissions: perms
                .iter()
                .map(|(r, a)| Permission {
                    resource: r.to_string(),
                    action: a.to_string(),
                })
                .collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_check_permission_matches_role_triples() {
        let engine = PolicyEngine::new();
        engine
            .sync_role(&role("Reader", &[(services::APPLICATION, "list")]))
            .await;

        let roles = vec!["Reader".to_string()];
        assert!(
            engine
                .check_permission(&roles, services::APPLICATION, "list")
                .await
        );
        assert!(
            !engine
                .check_permission(&roles, services::APPLICATION, "create")
                .await
        );
        assert!(
            !engine
                .check_permission(&["Other".to_string()], services::APPLICATION, "list")
                .await
        );
    }

    #[tokio::test]
    async fn test_wildcard_policy_matches_everything() {
        let engine = PolicyEngine::new();
        engine.sync_role(&role("Administrator", &[("*", "*")])).await;

        let roles = vec!["Administrator".to_string()];
        assert!(
            engine
                .check_permission(&roles, services::ROLE, "delete")
                .await
        );
        assert!(
            engine
                .check_permission(&roles, services::APPLICATION, "get_state_all")
                .await
        );
    }

    #[tokio::test]
    async fn test_sync_role_replaces_previous_triples() {
        let engine = PolicyEngine::new();
        engine
            .sync_role(&role("R", &[(services::LABEL, "list")]))
            .await;
        engine
            .sync_role(&role("R", &[(services::LABEL, "get")]))
            .await;

        let roles = vec!["R".to_string()];
        assert!(!engine.check_permission(&roles, services::LABEL, "list").await);
        assert!(engine.check_permission(&roles, services::LABEL, "get").await);
    }

    #[tokio::test]
    async fn test_ownership_never_grants_permission() {
        let engine = PolicyEngine::new();
        engine.add_ownership("alice", "res-1").await;
        assert!(
            !engine
                .check_permission(&["alice".to_string()], services::APPLICATION, "get")
                .await
        );
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            resolve_path("/api/application/get_state"),
            Some((services::APPLICATION, "get_state".to_string()))
        );
        assert_eq!(
            resolve_path("/api/stream/connect"),
            Some((services::STREAMING, "connect".to_string()))
        );
        assert_eq!(resolve_path("/api/unknown/x"), None);
        assert_eq!(resolve_path("/health"), None);
        assert_eq!(resolve_path("/api/application"), None);
        assert_eq!(resolve_path("/api/application/get/extra"), None);
    }

    #[test]
    fn test_all_variant() {
        assert_eq!(all_variant("get_state"), "get_state_all");
        assert_eq!(all_variant("list"), "list_all");
    }
}
