use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A versioned definition of an allocatable environment. Applications
/// reference a label by uid; labels are immutable once created (a changed
/// definition is a new version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub uid: Uuid,
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub definitions: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
