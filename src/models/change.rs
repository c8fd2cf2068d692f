use serde::{Deserialize, Serialize};

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Unspecified,
    Created,
    Updated,
    Removed,
}

/// Which entity family the object belongs to. `Unspecified` is reserved for
/// control frames on subscription streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    Unspecified,
    Application,
    ApplicationState,
    ApplicationTask,
    ApplicationResource,
    Label,
    Node,
    User,
    Role,
    UserGroup,
}

impl ObjectKind {
    /// Kinds whose events require a per-event application ownership check.
    pub fn is_application_scoped(&self) -> bool {
        matches!(
            self,
            ObjectKind::Application
                | ObjectKind::ApplicationState
                | ObjectKind::ApplicationTask
                | ObjectKind::ApplicationResource
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Unspecified => "UNSPECIFIED",
            ObjectKind::Application => "APPLICATION",
            ObjectKind::ApplicationState => "APPLICATION_STATE",
            ObjectKind::ApplicationTask => "APPLICATION_TASK",
            ObjectKind::ApplicationResource => "APPLICATION_RESOURCE",
            ObjectKind::Label => "LABEL",
            ObjectKind::Node => "NODE",
            ObjectKind::User => "USER",
            ObjectKind::Role => "ROLE",
            ObjectKind::UserGroup => "USER_GROUP",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One database change, as published by the store to subscription sinks.
/// `object` is the serialized entity at the time of the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub object_kind: ObjectKind,
    pub object: serde_json::Value,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(kind: ChangeKind, object_kind: ObjectKind, object: &T) -> Self {
        ChangeEvent {
            kind,
            object_kind,
            // Entities in this crate serialize infallibly; a failure here is
            // a programming error surfaced as a null payload, not a panic.
            object: serde_json::to_value(object).unwrap_or(serde_json::Value::Null),
        }
    }

    /// The application uid the event refers to, for application-scoped
    /// kinds. `Application` events carry `uid`; the satellite records carry
    /// `application_uid`.
    pub fn application_uid(&self) -> Option<uuid::Uuid> {
        let field = match self.object_kind {
            ObjectKind::Application => "uid",
            ObjectKind::ApplicationState
            | ObjectKind::ApplicationTask
            | ObjectKind::ApplicationResource => "application_uid",
            _ => return None,
        };
        self.object
            .get(field)
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ObjectKind::ApplicationState).unwrap(),
            serde_json::json!("APPLICATION_STATE")
        );
        assert_eq!(
            serde_json::to_value(ChangeKind::Created).unwrap(),
            serde_json::json!("CREATED")
        );
    }

    #[test]
    fn test_application_uid_extraction() {
        let uid = uuid::Uuid::new_v4();
        let event = ChangeEvent {
            kind: ChangeKind::Created,
            object_kind: ObjectKind::ApplicationState,
            object: serde_json::json!({ "application_uid": uid.to_string() }),
        };
        assert_eq!(event.application_uid(), Some(uid));

        let event = ChangeEvent {
            kind: ChangeKind::Created,
            object_kind: ObjectKind::Label,
            object: serde_json::json!({ "uid": uid.to_string() }),
        };
        assert_eq!(event.application_uid(), None);
    }
}
