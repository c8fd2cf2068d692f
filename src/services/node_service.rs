use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Node;
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct SetMaintenanceRequest {
    /// Defaults to the node this process runs as.
    pub node_uid: Option<Uuid>,
    pub maintenance: bool,
}

pub struct NodeService {
    store: Arc<Store>,
}

impl NodeService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Vec<Node> {
        self.store.node_list().await
    }

    pub async fn get_this(&self) -> Result<Node, ApiError> {
        self.store
            .node_this()
            .await
            .ok_or_else(|| ApiError::Internal("this node is not registered".to_string()))
    }

    pub async fn set_maintenance(&self, request: SetMaintenanceRequest) -> Result<Node, ApiError> {
        let mut node = match request.node_uid {
            Some(uid) => self
                .store
                .node_get(uid)
                .await
                .ok_or_else(|| ApiError::NotFound(format!("node {} not found", uid)))?,
            None => self.get_this().await?,
        };
        node.maintenance = request.maintenance;
        node.updated_at = Utc::now();
        self.store.node_update(node.clone()).await;
        tracing::info!(uid = %node.uid, maintenance = node.maintenance, "Node maintenance updated");
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_maintenance_defaults_to_this_node() {
        let store = Store::new();
        store
            .node_register_this(Node {
                uid: Uuid::new_v4(),
                name: "node-1".to_string(),
                address: "127.0.0.1:8001".to_string(),
                maintenance: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        let service = NodeService::new(store);

        let node = service
            .set_maintenance(SetMaintenanceRequest {
                node_uid: None,
                maintenance: true,
            })
            .await
            .unwrap();
        assert!(node.maintenance);
        assert!(service.get_this().await.unwrap().maintenance);
    }
}
