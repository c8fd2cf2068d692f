use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A service account. `name` is the primary identifier; role names reference
/// [`crate::models::Role`] records and feed the policy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// bcrypt hash; never serialized to clients.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub roles: Vec<String>,
    /// Optional user-group name; the store overlays the group's config for
    /// fields the user record leaves unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<UserConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user (or per-group) tuning knobs. Unset fields fall back to the
/// group's config and then to the service defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    /// Concurrent stream budget per class: `-1` unlimited, `0` reject all,
    /// `N` evict-oldest beyond N.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

impl UserConfig {
    /// Overlay: fields set on `self` win, unset fields come from `other`.
    pub fn merged_over(&self, other: &UserConfig) -> UserConfig {
        UserConfig {
            streams_limit: self.streams_limit.or(other.streams_limit),
            requests_per_minute: self.requests_per_minute.or(other.requests_per_minute),
        }
    }
}

impl User {
    pub fn streams_limit(&self, default: i32) -> i32 {
        self.config
            .as_ref()
            .and_then(|c| c.streams_limit)
            .unwrap_or(default)
    }

    pub fn requests_per_minute(&self, default: u32) -> u32 {
        self.config
            .as_ref()
            .and_then(|c| c.requests_per_minute)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_config(config: Option<UserConfig>) -> User {
        User {
            name: "alice".to_string(),
            password_hash: String::new(),
            roles: vec![],
            group: None,
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_streams_limit_falls_back_to_default() {
        let user = user_with_config(None);
        assert_eq!(user.streams_limit(1), 1);
    }

    #[test]
    fn test_streams_limit_uses_config() {
        let user = user_with_config(Some(UserConfig {
            streams_limit: Some(-1),
            requests_per_minute: None,
        }));
        assert_eq!(user.streams_limit(1), -1);
    }

    #[test]
    fn test_config_merge_prefers_user_fields() {
        let user = UserConfig {
            streams_limit: Some(3),
            requests_per_minute: None,
        };
        let group = UserConfig {
            streams_limit: Some(10),
            requests_per_minute: Some(120),
        };
        let merged = user.merged_over(&group);
        assert_eq!(merged.streams_limit, Some(3));
        assert_eq!(merged.requests_per_minute, Some(120));
    }
}
