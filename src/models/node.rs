use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A worker node in the cluster. The running process registers itself as
/// "this" node at startup; maintenance mode excludes a node from new
/// allocations without touching running ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uid: Uuid,
    pub name: String,
    pub address: String,
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
