use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an application's current state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    New,
    Allocated,
    Deallocate,
    Deallocated,
    Error,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::New => "NEW",
            ApplicationStatus::Allocated => "ALLOCATED",
            ApplicationStatus::Deallocate => "DEALLOCATE",
            ApplicationStatus::Deallocated => "DEALLOCATED",
            ApplicationStatus::Error => "ERROR",
        }
    }

    /// A terminal state accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Deallocated | ApplicationStatus::Error
        )
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource request made by a user against a label definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub uid: Uuid,
    pub owner_name: String,
    pub label_uid: Uuid,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time status of an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationState {
    pub application_uid: Uuid,
    pub status: ApplicationStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// An operation queued against an application (snapshot, image, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationTask {
    pub uid: Uuid,
    pub application_uid: Uuid,
    pub task: String,
    /// Status the application must reach before the task runs.
    pub when: ApplicationStatus,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The concrete allocation that fulfills an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationResource {
    pub uid: Uuid,
    pub application_uid: Uuid,
    pub node_uid: Uuid,
    pub identifier: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(ApplicationStatus::New).unwrap(),
            serde_json::json!("NEW")
        );
        assert_eq!(
            serde_json::to_value(ApplicationStatus::Deallocated).unwrap(),
            serde_json::json!("DEALLOCATED")
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ApplicationStatus::New.is_terminal());
        assert!(!ApplicationStatus::Allocated.is_terminal());
        assert!(ApplicationStatus::Deallocated.is_terminal());
        assert!(ApplicationStatus::Error.is_terminal());
    }
}
