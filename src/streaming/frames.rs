//! Wire frames for the Connect multiplexer and the Subscribe stream.
//!
//! Inbound multiplexer frames carry a string `request_type`; internally the
//! payload is parsed into the sealed [`RequestPayload`] sum so dispatch is
//! exhaustive at compile time; the string survives only at the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{ChangeEvent, ChangeKind, ObjectKind};
use crate::rbac::services;
use crate::services::application_service::{CreateApplicationRequest, CreateTaskRequest};
use crate::services::label_service::CreateLabelRequest;
use crate::services::node_service::SetMaintenanceRequest;
use crate::services::role_service::RoleRequest;
use crate::services::user_service::{CreateUserRequest, UpdateUserRequest};

/// Request ids reserved for server→client frames.
pub const KEEP_ALIVE_ID: &str = "keep-alive";
pub const SERVER_SHUTDOWN_ID: &str = "server-shutdown";
pub const STREAM_LIMIT_ID: &str = "stream-limit-exceeded";

// ---------------------------------------------------------------------------
// Multiplexer frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: String,
    pub request_type: String,
    #[serde(default)]
    pub request_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn from_api(err: &ApiError) -> Self {
        ErrorFrame {
            code: err.code_name().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: String,
    pub response_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

/// Reply type is derived mechanically: trailing `Request` becomes
/// `Response`.
pub fn response_type_for(request_type: &str) -> String {
    match request_type.strip_suffix("Request") {
        Some(stem) => format!("{}Response", stem),
        None => format!("{}Response", request_type),
    }
}

impl ResponseFrame {
    pub fn success(request_id: &str, request_type: &str, data: serde_json::Value) -> Self {
        ResponseFrame {
            request_id: request_id.to_string(),
            response_type: response_type_for(request_type),
            response_data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: &str, request_type: &str, err: &ApiError) -> Self {
        ResponseFrame {
            request_id: request_id.to_string(),
            response_type: response_type_for(request_type),
            response_data: None,
            error: Some(ErrorFrame::from_api(err)),
        }
    }

    pub fn keep_alive() -> Self {
        ResponseFrame {
            request_id: KEEP_ALIVE_ID.to_string(),
            response_type: "KeepAliveResponse".to_string(),
            response_data: None,
            error: None,
        }
    }

    pub fn server_shutdown() -> Self {
        ResponseFrame {
            request_id: SERVER_SHUTDOWN_ID.to_string(),
            response_type: "ServerShutdownNotification".to_string(),
            response_data: None,
            error: Some(ErrorFrame::from_api(&ApiError::Unavailable(
                "server is shutting down".to_string(),
            ))),
        }
    }

    pub fn stream_limit_exceeded() -> Self {
        ResponseFrame {
            request_id: STREAM_LIMIT_ID.to_string(),
            response_type: "StreamLimitExceededNotification".to_string(),
            response_data: None,
            error: Some(ErrorFrame::from_api(&ApiError::ResourceExhausted(
                "stream limit exceeded".to_string(),
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ByApplicationUid {
    application_uid: Uuid,
}

#[derive(Debug, Deserialize)]
struct ByTaskUid {
    task_uid: Uuid,
}

#[derive(Debug, Deserialize)]
struct ByLabelUid {
    label_uid: Uuid,
}

#[derive(Debug, Deserialize)]
struct ByName {
    name: String,
}

/// Sealed sum of every request the multiplexer accepts. The Auth family is
/// unary-only: a session exists before any Connect stream is opened.
#[derive(Debug)]
pub enum RequestPayload {
    ApplicationList,
    ApplicationGet { application_uid: Uuid },
    ApplicationCreate(CreateApplicationRequest),
    ApplicationGetState { application_uid: Uuid },
    ApplicationGetResource { application_uid: Uuid },
    ApplicationListTask { application_uid: Uuid },
    ApplicationCreateTask(CreateTaskRequest),
    ApplicationGetTask { task_uid: Uuid },
    ApplicationDeallocate { application_uid: Uuid },
    LabelList,
    LabelGet { label_uid: Uuid },
    LabelCreate(CreateLabelRequest),
    LabelRemove { label_uid: Uuid },
    NodeList,
    NodeGetThis,
    NodeSetMaintenance(SetMaintenanceRequest),
    UserGetMe,
    UserList,
    UserGet { name: String },
    UserCreate(CreateUserRequest),
    UserUpdate(UpdateUserRequest),
    UserRemove { name: String },
    RoleList,
    RoleGet { name: String },
    RoleCreate(RoleRequest),
    RoleUpdate(RoleRequest),
    RoleDelete { name: String },
}

fn parse_data<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(data)
        .map_err(|e| ApiError::InvalidArgument(format!("malformed request data: {}", e)))
}

impl RequestPayload {
    /// Map the wire tag to a typed payload. Unknown tags are
    /// `Unimplemented`; malformed payloads are `InvalidArgument`.
    pub fn parse(request_type: &str, data: serde_json::Value) -> Result<Self, ApiError> {
        let payload = match request_type {
            "ApplicationServiceListRequest" => RequestPayload::ApplicationList,
            "ApplicationServiceGetRequest" => {
                let ByApplicationUid { application_uid } = parse_data(data)?;
                RequestPayload::ApplicationGet { application_uid }
            }
            "ApplicationServiceCreateRequest" => {
                RequestPayload::ApplicationCreate(parse_data(data)?)
            }
            "ApplicationServiceGetStateRequest" => {
                let ByApplicationUid { application_uid } = parse_data(data)?;
                RequestPayload::ApplicationGetState { application_uid }
            }
            "ApplicationServiceGetResourceRequest" => {
                let ByApplicationUid { application_uid } = parse_data(data)?;
                RequestPayload::ApplicationGetResource { application_uid }
            }
            "ApplicationServiceListTaskRequest" => {
                let ByApplicationUid { application_uid } = parse_data(data)?;
                RequestPayload::ApplicationListTask { application_uid }
            }
            "ApplicationServiceCreateTaskRequest" => {
                RequestPayload::ApplicationCreateTask(parse_data(data)?)
            }
            "ApplicationServiceGetTaskRequest" => {
                let ByTaskUid { task_uid } = parse_data(data)?;
                RequestPayload::ApplicationGetTask { task_uid }
            }
            "ApplicationServiceDeallocateRequest" => {
                let ByApplicationUid { application_uid } = parse_data(data)?;
                RequestPayload::ApplicationDeallocate { application_uid }
            }
            "LabelServiceListRequest" => RequestPayload::LabelList,
            "LabelServiceGetRequest" => {
                let ByLabelUid { label_uid } = parse_data(data)?;
                RequestPayload::LabelGet { label_uid }
            }
            "LabelServiceCreateRequest" => RequestPayload::LabelCreate(parse_data(data)?),
            "LabelServiceRemoveRequest" => {
                let ByLabelUid { label_uid } = parse_data(data)?;
                RequestPayload::LabelRemove { label_uid }
            }
            "NodeServiceListRequest" => RequestPayload::NodeList,
            "NodeServiceGetThisRequest" => RequestPayload::NodeGetThis,
            "NodeServiceSetMaintenanceRequest" => {
                RequestPayload::NodeSetMaintenance(parse_data(data)?)
            }
            "UserServiceGetMeRequest" => RequestPayload::UserGetMe,
            "UserServiceListRequest" => RequestPayload::UserList,
            "UserServiceGetRequest" => {
                let ByName { name } = parse_data(data)?;
                RequestPayload::UserGet { name }
            }
            "UserServiceCreateRequest" => RequestPayload::UserCreate(parse_data(data)?),
            "UserServiceUpdateRequest" => RequestPayload::UserUpdate(parse_data(data)?),
            "UserServiceRemoveRequest" => {
                let ByName { name } = parse_data(data)?;
                RequestPayload::UserRemove { name }
            }
            "RoleServiceListRequest" => RequestPayload::RoleList,
            "RoleServiceGetRequest" => {
                let ByName { name } = parse_data(data)?;
                RequestPayload::RoleGet { name }
            }
            "RoleServiceCreateRequest" => RequestPayload::RoleCreate(parse_data(data)?),
            "RoleServiceUpdateRequest" => RequestPayload::RoleUpdate(parse_data(data)?),
            "RoleServiceDeleteRequest" => {
                let ByName { name } = parse_data(data)?;
                RequestPayload::RoleDelete { name }
            }
            other => {
                return Err(ApiError::Unimplemented(format!(
                    "unknown request type {}",
                    other
                )))
            }
        };
        Ok(payload)
    }

    /// The `(service, method)` pair checked by the RBAC gate before
    /// dispatch.
    pub fn procedure(&self) -> (&'static str, &'static str) {
        match self {
            RequestPayload::ApplicationList => (services::APPLICATION, "list"),
            RequestPayload::ApplicationGet { .. } => (services::APPLICATION, "get"),
            RequestPayload::ApplicationCreate(_) => (services::APPLICATION, "create"),
            RequestPayload::ApplicationGetState { .. } => (services::APPLICATION, "get_state"),
            RequestPayload::ApplicationGetResource { .. } => {
                (services::APPLICATION, "get_resource")
            }
            RequestPayload::ApplicationListTask { .. } => (services::APPLICATION, "list_task"),
            RequestPayload::ApplicationCreateTask(_) => (services::APPLICATION, "create_task"),
            RequestPayload::ApplicationGetTask { .. } => (services::APPLICATION, "get_task"),
            RequestPayload::ApplicationDeallocate { .. } => (services::APPLICATION, "deallocate"),
            RequestPayload::LabelList => (services::LABEL, "list"),
            RequestPayload::LabelGet { .. } => (services::LABEL, "get"),
            RequestPayload::LabelCreate(_) => (services::LABEL, "create"),
            RequestPayload::LabelRemove { .. } => (services::LABEL, "remove"),
            RequestPayload::NodeList => (services::NODE, "list"),
            RequestPayload::NodeGetThis => (services::NODE, "get_this"),
            RequestPayload::NodeSetMaintenance(_) => (services::NODE, "set_maintenance"),
            RequestPayload::UserGetMe => (services::USER, "get_me"),
            RequestPayload::UserList => (services::USER, "list"),
            RequestPayload::UserGet { .. } => (services::USER, "get"),
            RequestPayload::UserCreate(_) => (services::USER, "create"),
            RequestPayload::UserUpdate(_) => (services::USER, "update"),
            RequestPayload::UserRemove { .. } => (services::USER, "remove"),
            RequestPayload::RoleList => (services::ROLE, "list"),
            RequestPayload::RoleGet { .. } => (services::ROLE, "get"),
            RequestPayload::RoleCreate(_) => (services::ROLE, "create"),
            RequestPayload::RoleUpdate(_) => (services::ROLE, "update"),
            RequestPayload::RoleDelete { .. } => (services::ROLE, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription frames
// ---------------------------------------------------------------------------

/// First client frame on a Subscribe stream.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub subscription_types: Vec<ObjectKind>,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

pub const APPLICATION_UID_FILTER: &str = "application_uid";

/// One outbound frame on a Subscribe stream. Control frames carry
/// `object_type = UNSPECIFIED` and no data, except the initial CREATED frame
/// which carries the assigned stream id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub object_type: ObjectKind,
    pub change_type: ChangeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

impl StreamEvent {
    pub fn data(event: &ChangeEvent) -> Self {
        StreamEvent {
            object_type: event.object_kind,
            change_type: event.kind,
            timestamp: Utc::now(),
            object_data: Some(event.object.clone()),
            error: None,
        }
    }

    fn control(change_type: ChangeKind) -> Self {
        StreamEvent {
            object_type: ObjectKind::Unspecified,
            change_type,
            timestamp: Utc::now(),
            object_data: None,
            error: None,
        }
    }

    /// Confirmation-of-readiness, ordered before any data frame.
    pub fn opened(stream_id: &str) -> Self {
        let mut frame = Self::control(ChangeKind::Created);
        frame.object_data = Some(serde_json::json!({ "stream_uid": stream_id }));
        frame
    }

    pub fn removed() -> Self {
        Self::control(ChangeKind::Removed)
    }

    pub fn keep_alive() -> Self {
        Self::control(ChangeKind::Unspecified)
    }

    pub fn error(err: &ApiError) -> Self {
        let mut frame = Self::control(ChangeKind::Unspecified);
        frame.error = Some(ErrorFrame::from_api(err));
        frame
    }

    pub fn limit_exceeded() -> Self {
        Self::error(&ApiError::ResourceExhausted(
            "stream limit exceeded".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_derivation() {
        assert_eq!(
            response_type_for("ApplicationServiceGetStateRequest"),
            "ApplicationServiceGetStateResponse"
        );
        assert_eq!(response_type_for("Odd"), "OddResponse");
    }

    #[test]
    fn test_unknown_request_type_is_unimplemented() {
        let err = RequestPayload::parse("NoSuchRequest", serde_json::Value::Null).unwrap_err();
        assert_eq!(err.code_name(), "Unimplemented");
    }

    #[test]
    fn test_malformed_data_is_invalid_argument() {
        let err = RequestPayload::parse(
            "ApplicationServiceGetRequest",
            serde_json::json!({ "application_uid": "not-a-uuid" }),
        )
        .unwrap_err();
        assert_eq!(err.code_name(), "InvalidArgument");
    }

    #[test]
    fn test_every_known_type_round_trips_to_its_procedure() {
        let uid = Uuid::new_v4().to_string();
        let cases: Vec<(&str, serde_json::Value, (&str, &str))> = vec![
            ("ApplicationServiceListRequest", serde_json::Value::Null, (services::APPLICATION, "list")),
            (
                "ApplicationServiceGetStateRequest",
                serde_json::json!({ "application_uid": uid }),
                (services::APPLICATION, "get_state"),
            ),
            ("LabelServiceListRequest", serde_json::Value::Null, (services::LABEL, "list")),
            ("NodeServiceGetThisRequest", serde_json::Value::Null, (services::NODE, "get_this")),
            ("UserServiceGetMeRequest", serde_json::Value::Null, (services::USER, "get_me")),
            (
                "RoleServiceGetRequest",
                serde_json::json!({ "name": "User" }),
                (services::ROLE, "get"),
            ),
        ];
        for (tag, data, procedure) in cases {
            let payload = RequestPayload::parse(tag, data).unwrap();
            assert_eq!(payload.procedure(), procedure, "procedure for {}", tag);
        }
    }

    #[test]
    fn test_control_frames_carry_unspecified_object_type() {
        let opened = StreamEvent::opened("alice-node-1");
        assert_eq!(opened.object_type, ObjectKind::Unspecified);
        assert_eq!(opened.change_type, ChangeKind::Created);
        assert!(opened.object_data.is_some());

        let removed = StreamEvent::removed();
        assert_eq!(removed.change_type, ChangeKind::Removed);
        assert!(removed.object_data.is_none());
    }
}
