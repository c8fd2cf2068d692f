//! Request multiplexer.
//!
//! One Connect stream carries many logical RPCs. A dedicated reader task
//! feeds a bounded channel; the main loop multiplexes cancellation, the
//! 30-second keep-alive tick and incoming frames, spawning one worker per
//! frame. Workers run in parallel, so responses are not ordered with
//! respect to requests and clients correlate by `request_id`; all share the
//! writer through the stream's [`FrameSink`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::User;
use crate::rbac;
use crate::services::{
    ApplicationService, LabelService, NodeService, RoleService, UserService,
};
use crate::streaming::frames::{RequestFrame, RequestPayload, ResponseFrame};
use crate::streaming::registry::{StreamClass, StreamHandle};
use crate::streaming::sink::FrameSink;
use crate::AppState;

/// Capacity of the reader → dispatcher frame channel.
const INBOUND_CHANNEL_CAPACITY: usize = 10;
/// Connection keep-alive period.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(30);

enum Inbound {
    Frame(RequestFrame),
    Malformed(String),
}

/// Drive one Connect stream from upgrade to teardown.
pub async fn run_connection(state: AppState, user: User, socket: WebSocket) {
    let (ws_tx, ws_rx) = socket.split();
    let sink = FrameSink::new(ws_tx);

    let handle = StreamHandle::new(
        format!("{}-{}", user.name, Uuid::new_v4()),
        user.name.clone(),
        StreamClass::Connect,
        sink.clone(),
        CancellationToken::new(),
    );

    let limit = user.streams_limit(state.settings.limits.default_streams_limit);
    if let Err(err) = state.streams.register(handle.clone(), limit).await {
        let _ = sink
            .send(&ResponseFrame::failure("connect", "ConnectRequest", &err))
            .await;
        sink.close().await;
        return;
    }

    // Initial keep-alive as liveness proof.
    if sink.send(&ResponseFrame::keep_alive()).await.is_err() {
        finish_connection(&state, &handle).await;
        sink.close().await;
        return;
    }

    tracing::info!(id = %handle.id, "Connection opened");

    let (frame_tx, mut frame_rx) = mpsc::channel::<Inbound>(INBOUND_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_frames(ws_rx, frame_tx, handle.cancel.clone()));

    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_PERIOD,
        KEEP_ALIVE_PERIOD,
    );

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = keep_alive.tick() => {
                if sink.send(&ResponseFrame::keep_alive()).await.is_err() {
                    break;
                }
            }
            inbound = frame_rx.recv() => match inbound {
                // Reader finished: EOF or transport error.
                None => break,
                Some(Inbound::Malformed(detail)) => {
                    let err = ApiError::InvalidArgument(detail);
                    let _ = sink.send(&ResponseFrame::failure("", "Error", &err)).await;
                }
                Some(Inbound::Frame(frame)) => {
                    let state = state.clone();
                    let user = user.clone();
                    let sink = sink.clone();
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let work = handle_frame(state, user, frame, sink);
                        if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                            tracing::error!(
                                id = %handle.id,
                                "Worker panicked: {:?}",
                                panic.downcast_ref::<&str>()
                            );
                            handle.mark_closing();
                            handle.cancel.cancel();
                        }
                    });
                }
            }
        }
    }

    finish_connection(&state, &handle).await;
    handle.cancel.cancel();
    let _ = reader.await;
    sink.close().await;
    tracing::info!(id = %handle.id, "Connection closed");
}

async fn finish_connection(state: &AppState, handle: &StreamHandle) {
    handle.mark_closing();
    state.streams.remove(handle).await;
}

/// Reader task: transport → bounded channel. Closes the channel on EOF or
/// cancellation by dropping the sender.
async fn read_frames(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    frame_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_rx.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                let inbound = match serde_json::from_str::<RequestFrame>(&text) {
                    Ok(frame) => Inbound::Frame(frame),
                    Err(e) => Inbound::Malformed(format!("malformed request frame: {}", e)),
                };
                if frame_tx.send(inbound).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by the transport; binary frames ignored.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("Connection transport error: {}", e);
                break;
            }
        }
    }
}

/// One worker: RBAC, typed dispatch, response frame. Handler errors become
/// in-band error frames; the connection stays open.
async fn handle_frame(state: AppState, user: User, frame: RequestFrame, sink: Arc<FrameSink>) {
    let result = process_frame(&state, &user, &frame).await;
    let response = match result {
        Ok(data) => ResponseFrame::success(&frame.request_id, &frame.request_type, data),
        Err(err) => {
            tracing::debug!(
                request_id = %frame.request_id,
                request_type = %frame.request_type,
                "Request failed: {}",
                err
            );
            ResponseFrame::failure(&frame.request_id, &frame.request_type, &err)
        }
    };
    if let Err(err) = sink.send(&response).await {
        tracing::debug!(request_id = %frame.request_id, "Response dropped: {}", err);
    }
}

pub(crate) async fn process_frame(
    state: &AppState,
    user: &User,
    frame: &RequestFrame,
) -> Result<serde_json::Value, ApiError> {
    let payload = RequestPayload::parse(&frame.request_type, frame.request_data.clone())?;

    let (service, method) = payload.procedure();
    if !rbac::is_rbac_exempt(service, method)
        && !state
            .policy
            .check_permission(&user.roles, service, method)
            .await
    {
        return Err(ApiError::PermissionDenied(format!(
            "no access to {}/{}",
            service, method
        )));
    }

    dispatch(state, user, payload).await
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|e| ApiError::Internal(format!("response serialization failed: {}", e)))
}

/// Exhaustive dispatch over the typed payload sum.
async fn dispatch(
    state: &AppState,
    user: &User,
    payload: RequestPayload,
) -> Result<serde_json::Value, ApiError> {
    let applications = ApplicationService::new(state.store.clone(), state.policy.clone());
    let labels = LabelService::new(state.store.clone());
    let nodes = NodeService::new(state.store.clone());
    let users = UserService::new(state.store.clone(), state.policy.clone());
    let roles = RoleService::new(state.store.clone(), state.policy.clone());

    match payload {
        RequestPayload::ApplicationList => to_json(applications.list(user).await?),
        RequestPayload::ApplicationGet { application_uid } => {
            to_json(applications.get(user, application_uid).await?)
        }
        RequestPayload::ApplicationCreate(request) => {
            to_json(applications.create(user, request).await?)
        }
        RequestPayload::ApplicationGetState { application_uid } => {
            to_json(applications.get_state(user, application_uid).await?)
        }
        RequestPayload::ApplicationGetResource { application_uid } => {
            to_json(applications.get_resource(user, application_uid).await?)
        }
        RequestPayload::ApplicationListTask { application_uid } => {
            to_json(applications.list_task(user, application_uid).await?)
        }
        RequestPayload::ApplicationCreateTask(request) => {
            to_json(applications.create_task(user, request).await?)
        }
        RequestPayload::ApplicationGetTask { task_uid } => {
            to_json(applications.get_task(user, task_uid).await?)
        }
        RequestPayload::ApplicationDeallocate { application_uid } => {
            to_json(applications.deallocate(user, application_uid).await?)
        }
        RequestPayload::LabelList => to_json(labels.list().await),
        RequestPayload::LabelGet { label_uid } => to_json(labels.get(label_uid).await?),
        RequestPayload::LabelCreate(request) => to_json(labels.create(request).await?),
        RequestPayload::LabelRemove { label_uid } => to_json(labels.remove(label_uid).await?),
        RequestPayload::NodeList => to_json(nodes.list().await),
        RequestPayload::NodeGetThis => to_json(nodes.get_this().await?),
        RequestPayload::NodeSetMaintenance(request) => {
            to_json(nodes.set_maintenance(request).await?)
        }
        RequestPayload::UserGetMe => to_json(user.clone()),
        RequestPayload::UserList => to_json(users.list().await),
        RequestPayload::UserGet { name } => to_json(users.get(&name).await?),
        RequestPayload::UserCreate(request) => to_json(users.create(request).await?),
        RequestPayload::UserUpdate(request) => to_json(users.update(user, request).await?),
        RequestPayload::UserRemove { name } => to_json(users.remove(&name).await?),
        RequestPayload::RoleList => to_json(roles.list().await),
        RequestPayload::RoleGet { name } => to_json(roles.get(&name).await?),
        RequestPayload::RoleCreate(request) => to_json(roles.create(request).await?),
        RequestPayload::RoleUpdate(request) => to_json(roles.update(request).await?),
        RequestPayload::RoleDelete { name } => to_json(roles.delete(&name).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectKind;
    use crate::streaming::frames::response_type_for;
    use chrono::Utc;

    fn test_user(name: &str, roles: &[&str]) -> User {
        User {
            name: name.to_string(),
            password_hash: String::new(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            group: None,
            config: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn test_state() -> AppState {
        let state = AppState::for_tests().await;
        for role in rbac::builtin_roles() {
            state.store.role_insert(role.clone()).await;
            state.policy.sync_role(&role).await;
        }
        state
    }

    fn frame(id: &str, request_type: &str, data: serde_json::Value) -> RequestFrame {
        RequestFrame {
            request_id: id.to_string(),
            request_type: request_type.to_string(),
            request_data: data,
        }
    }

    #[tokio::test]
    async fn test_process_frame_dispatches_and_respects_rbac() {
        let state = test_state().await;
        let alice = test_user("alice", &["User"]);

        // Allowed: label list.
        let result = process_frame(
            &state,
            &alice,
            &frame("r1", "LabelServiceListRequest", serde_json::Value::Null),
        )
        .await;
        assert!(result.is_ok());

        // Denied: role management needs elevation.
        let result = process_frame(
            &state,
            &alice,
            &frame("r2", "RoleServiceListRequest", serde_json::Value::Null),
        )
        .await;
        assert_eq!(result.unwrap_err().code_name(), "PermissionDenied");

        // Unknown type.
        let result = process_frame(
            &state,
            &alice,
            &frame("r3", "MysteryRequest", serde_json::Value::Null),
        )
        .await;
        assert_eq!(result.unwrap_err().code_name(), "Unimplemented");
    }

    #[tokio::test]
    async fn test_get_me_is_rbac_exempt() {
        let state = test_state().await;
        // No roles at all, still allowed.
        let nobody = test_user("nobody", &[]);
        let result = process_frame(
            &state,
            &nobody,
            &frame("r1", "UserServiceGetMeRequest", serde_json::Value::Null),
        )
        .await
        .unwrap();
        assert_eq!(result.get("name").unwrap().as_str().unwrap(), "nobody");
    }

    #[tokio::test]
    async fn test_slow_request_does_not_block_fast_one() {
        // Workers share one sink; a slow handler must not delay a fast one.
        // Model the two workers directly against a shared FrameSink.
        let sink = FrameSink::buffered();

        let slow = {
            let sink = sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                sink.send(&ResponseFrame::success(
                    "R1",
                    "SlowRequest",
                    serde_json::Value::Null,
                ))
                .await
                .unwrap();
            })
        };
        let fast = {
            let sink = sink.clone();
            tokio::spawn(async move {
                sink.send(&ResponseFrame::success(
                    "R2",
                    "FastRequest",
                    serde_json::Value::Null,
                ))
                .await
                .unwrap();
            })
        };
        fast.await.unwrap();
        slow.await.unwrap();

        let frames = sink.sent_frames().await;
        let parsed: Vec<ResponseFrame> = frames
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(parsed[0].request_id, "R2");
        assert_eq!(parsed[0].response_type, response_type_for("FastRequest"));
        assert_eq!(parsed[1].request_id, "R1");
    }

    #[tokio::test]
    async fn test_create_application_via_multiplexer_publishes_state() {
        let state = test_state().await;
        let alice = test_user("alice", &["User"]);

        let label = LabelService::new(state.store.clone())
            .create(crate::services::label_service::CreateLabelRequest {
                name: "ubuntu".to_string(),
                version: 1,
                definitions: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        state.store.subscribe(ObjectKind::ApplicationState, tx).await;

        let result = process_frame(
            &state,
            &alice,
            &frame(
                "r1",
                "ApplicationServiceCreateRequest",
                serde_json::json!({ "label_uid": label.uid }),
            ),
        )
        .await
        .unwrap();
        let created_uid = result.get("uid").unwrap().as_str().unwrap().to_string();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.object_kind, ObjectKind::ApplicationState);
        assert_eq!(
            event.object.get("application_uid").unwrap().as_str().unwrap(),
            created_uid
        );
    }
}
