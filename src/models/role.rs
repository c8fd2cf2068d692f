use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single `(resource, action)` capability, e.g.
/// `{ resource: "ApplicationService", action: "get_state_all" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

/// Named capability bundle. Users carry role names; the policy engine
/// evaluates the flattened permission triples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p.resource == resource && p.action == action)
    }
}
