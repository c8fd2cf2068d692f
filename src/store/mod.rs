//! In-memory store.
//!
//! Entity maps plus per-kind change publication. Every mutation publishes a
//! [`ChangeEvent`] to the sinks registered for that object kind; publication
//! is strictly non-blocking (`try_send`) so a stalled subscriber can never
//! delay a writer. A full sink drops the event; a closed sink is pruned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::{
    Application, ApplicationResource, ApplicationState, ApplicationTask, ChangeEvent, ChangeKind,
    Label, Node, ObjectKind, Role, User, UserConfig,
};

/// Handle identifying one registered change sink, for unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

struct SinkEntry {
    id: SinkId,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Entities {
    users: HashMap<String, User>,
    groups: HashMap<String, UserConfig>,
    roles: HashMap<String, Role>,
    labels: HashMap<Uuid, Label>,
    nodes: HashMap<Uuid, Node>,
    applications: HashMap<Uuid, Application>,
    /// Full state history per application; the latest entry is current.
    application_states: HashMap<Uuid, Vec<ApplicationState>>,
    application_tasks: HashMap<Uuid, ApplicationTask>,
    application_resources: HashMap<Uuid, ApplicationResource>,
}

pub struct Store {
    entities: RwLock<Entities>,
    publishers: RwLock<HashMap<ObjectKind, Vec<SinkEntry>>>,
    next_sink_id: AtomicU64,
    this_node: RwLock<Option<Uuid>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Store {
            entities: RwLock::new(Entities::default()),
            publishers: RwLock::new(HashMap::new()),
            next_sink_id: AtomicU64::new(1),
            this_node: RwLock::new(None),
        })
    }

    // -----------------------------------------------------------------
    // Change publication
    // -----------------------------------------------------------------

    /// Register a sink for one object kind. The store only ever `try_send`s
    /// into it; the caller owns the receiving side and its capacity.
    pub async fn subscribe(&self, kind: ObjectKind, tx: mpsc::Sender<ChangeEvent>) -> SinkId {
        let id = SinkId(self.next_sink_id.fetch_add(1, Ordering::Relaxed));
        self.publishers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(SinkEntry { id, tx });
        id
    }

    pub async fn unsubscribe(&self, kind: ObjectKind, id: SinkId) {
        if let Some(sinks) = self.publishers.write().await.get_mut(&kind) {
            sinks.retain(|s| s.id != id);
        }
    }

    /// Fan the event out to every sink of its kind, never blocking.
    pub async fn publish(&self, event: ChangeEvent) {
        let mut publishers = self.publishers.write().await;
        let Some(sinks) = publishers.get_mut(&event.object_kind) else {
            return;
        };
        sinks.retain(|sink| match sink.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    kind = %event.object_kind,
                    "Change sink full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    // -----------------------------------------------------------------
    // Users & groups
    // -----------------------------------------------------------------

    pub async fn user_get(&self, name: &str) -> Option<User> {
        self.entities.read().await.users.get(name).cloned()
    }

    /// Lookup with group configuration overlaid, as handed to the request
    /// context after authentication.
    pub async fn user_with_config(&self, name: &str) -> Option<User> {
        let entities = self.entities.read().await;
        let mut user = entities.users.get(name)?.clone();
        let group_config = user
            .group
            .as_deref()
            .and_then(|g| entities.groups.get(g))
            .cloned();
        if let Some(group_config) = group_config {
            let own = user.config.clone().unwrap_or_default();
            user.config = Some(own.merged_over(&group_config));
        }
        Some(user)
    }

    pub async fn user_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.entities.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    pub async fn user_insert(&self, user: User) -> bool {
        {
            let mut entities = self.entities.write().await;
            if entities.users.contains_key(&user.name) {
                return false;
            }
            entities.users.insert(user.name.clone(), user.clone());
        }
        self.publish(ChangeEvent::new(ChangeKind::Created, ObjectKind::User, &user))
            .await;
        true
    }

    pub async fn user_update(&self, user: User) -> bool {
        {
            let mut entities = self.entities.write().await;
            if !entities.users.contains_key(&user.name) {
                return false;
            }
            entities.users.insert(user.name.clone(), user.clone());
        }
        self.publish(ChangeEvent::new(ChangeKind::Updated, ObjectKind::User, &user))
            .await;
        true
    }

    pub async fn user_remove(&self, name: &str) -> Option<User> {
        let removed = self.entities.write().await.users.remove(name);
        if let Some(ref user) = removed {
            self.publish(ChangeEvent::new(ChangeKind::Removed, ObjectKind::User, user))
                .await;
        }
        removed
    }

    pub async fn group_set(&self, name: &str, config: UserConfig) {
        self.entities
            .write()
            .await
            .groups
            .insert(name.to_string(), config);
    }

    // -----------------------------------------------------------------
    // Roles
    // -----------------------------------------------------------------

    pub async fn role_get(&self, name: &str) -> Option<Role> {
        self.entities.read().await.roles.get(name).cloned()
    }

    pub async fn role_list(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.entities.read().await.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    pub async fn role_insert(&self, role: Role) -> bool {
        {
            let mut entities = self.entities.write().await;
            if entities.roles.contains_key(&role.name) {
                return false;
            }
            entities.roles.insert(role.name.clone(), role.clone());
        }
        self.publish(ChangeEvent::new(ChangeKind::Created, ObjectKind::Role, &role))
            .await;
        true
    }

    pub async fn role_update(&self, role: Role) -> bool {
        {
            let mut entities = self.entities.write().await;
            if !entities.roles.contains_key(&role.name) {
                return false;
            }
            entities.roles.insert(role.name.clone(), role.clone());
        }
        self.publish(ChangeEvent::new(ChangeKind::Updated, ObjectKind::Role, &role))
            .await;
        true
    }

    pub async fn role_remove(&self, name: &str) -> Option<Role> {
        let removed = self.entities.write().await.roles.remove(name);
        if let Some(ref role) = removed {
            self.publish(ChangeEvent::new(ChangeKind::Removed, ObjectKind::Role, role))
                .await;
        }
        removed
    }

    // -----------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------

    pub async fn label_get(&self, uid: Uuid) -> Option<Label> {
        self.entities.read().await.labels.get(&uid).cloned()
    }

    pub async fn label_list(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.entities.read().await.labels.values().cloned().collect();
        labels.sort_by(|a, b| (a.name.clone(), a.version).cmp(&(b.name.clone(), b.version)));
        labels
    }

    pub async fn label_find_version(&self, name: &str, version: u32) -> Option<Label> {
        self.entities
            .read()
            .await
            .labels
            .values()
            .find(|l| l.name == name && l.version == version)
            .cloned()
    }

    pub async fn label_insert(&self, label: Label) {
        self.entities
            .write()
            .await
            .labels
            .insert(label.uid, label.clone());
        self.publish(ChangeEvent::new(
            ChangeKind::Created,
            ObjectKind::Label,
            &label,
        ))
        .await;
    }

    pub async fn label_remove(&self, uid: Uuid) -> Option<Label> {
        let removed = self.entities.write().await.labels.remove(&uid);
        if let Some(ref label) = removed {
            self.publish(ChangeEvent::new(
                ChangeKind::Removed,
                ObjectKind::Label,
                label,
            ))
            .await;
        }
        removed
    }

    /// Whether any application still references the label.
    pub async fn label_in_use(&self, uid: Uuid) -> bool {
        self.entities
            .read()
            .await
            .applications
            .values()
            .any(|a| a.label_uid == uid)
    }

    // -----------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------

    pub async fn node_get(&self, uid: Uuid) -> Option<Node> {
        self.entities.read().await.nodes.get(&uid).cloned()
    }

    pub async fn node_list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.entities.read().await.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Register the node this process runs as. Called once at startup.
    pub async fn node_register_this(&self, node: Node) {
        let uid = node.uid;
        self.entities.write().await.nodes.insert(uid, node.clone());
        *self.this_node.write().await = Some(uid);
        self.publish(ChangeEvent::new(ChangeKind::Created, ObjectKind::Node, &node))
            .await;
    }

    pub async fn node_this(&self) -> Option<Node> {
        let uid = (*self.this_node.read().await)?;
        self.node_get(uid).await
    }

    pub async fn node_update(&self, node: Node) -> bool {
        {
            let mut entities = self.entities.write().await;
            if !entities.nodes.contains_key(&node.uid) {
                return false;
            }
            entities.nodes.insert(node.uid, node.clone());
        }
        self.publish(ChangeEvent::new(ChangeKind::Updated, ObjectKind::Node, &node))
            .await;
        true
    }

    // -----------------------------------------------------------------
    // Applications
    // -----------------------------------------------------------------

    pub async fn application_get(&self, uid: Uuid) -> Option<Application> {
        self.entities.read().await.applications.get(&uid).cloned()
    }

    pub async fn application_list(&self) -> Vec<Application> {
        let mut apps: Vec<Application> = self
            .entities
            .read()
            .await
            .applications
            .values()
            .cloned()
            .collect();
        apps.sort_by_key(|a| a.created_at);
        apps
    }

    pub async fn application_insert(&self, app: Application) {
        self.entities
            .write()
            .await
            .applications
            .insert(app.uid, app.clone());
        self.publish(ChangeEvent::new(
            ChangeKind::Created,
            ObjectKind::Application,
            &app,
        ))
        .await;
    }

    /// Append a state record; each state row is a new immutable entry, so
    /// the published change kind is always CREATED.
    pub async fn application_state_push(&self, state: ApplicationState) {
        self.entities
            .write()
            .await
            .application_states
            .entry(state.application_uid)
            .or_default()
            .push(state.clone());
        self.publish(ChangeEvent::new(
            ChangeKind::Created,
            ObjectKind::ApplicationState,
            &state,
        ))
        .await;
    }

    pub async fn application_state_latest(&self, uid: Uuid) -> Option<ApplicationState> {
        self.entities
            .read()
            .await
            .application_states
            .get(&uid)
            .and_then(|states| states.last().cloned())
    }

    pub async fn application_task_insert(&self, task: ApplicationTask) {
        self.entities
            .write()
            .await
            .application_tasks
            .insert(task.uid, task.clone());
        self.publish(ChangeEvent::new(
            ChangeKind::Created,
            ObjectKind::ApplicationTask,
            &task,
        ))
        .await;
    }

    pub async fn application_task_get(&self, uid: Uuid) -> Option<ApplicationTask> {
        self.entities
            .read()
            .await
            .application_tasks
            .get(&uid)
            .cloned()
    }

    pub async fn application_task_list(&self, application_uid: Uuid) -> Vec<ApplicationTask> {
        let mut tasks: Vec<ApplicationTask> = self
            .entities
            .read()
            .await
            .application_tasks
            .values()
            .filter(|t| t.application_uid == application_uid)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn application_resource_insert(&self, resource: ApplicationResource) {
        self.entities
            .write()
            .await
            .application_resources
            .insert(resource.uid, resource.clone());
        self.publish(ChangeEvent::new(
            ChangeKind::Created,
            ObjectKind::ApplicationResource,
            &resource,
        ))
        .await;
    }

    pub async fn application_resource_for(&self, application_uid: Uuid) -> Option<ApplicationResource> {
        self.entities
            .read()
            .await
            .application_resources
            .values()
            .find(|r| r.application_uid == application_uid)
            .cloned()
    }

    pub async fn application_resource_remove(&self, application_uid: Uuid) -> Option<ApplicationResource> {
        let removed = {
            let mut entities = self.entities.write().await;
            let uid = entities
                .application_resources
                .values()
                .find(|r| r.application_uid == application_uid)
                .map(|r| r.uid);
            uid.and_then(|uid| entities.application_resources.remove(&uid))
        };
        if let Some(ref resource) = removed {
            self.publish(ChangeEvent::new(
                ChangeKind::Removed,
                ObjectKind::ApplicationResource,
                resource,
            ))
            .await;
        }
        removed
    }
}
