//! Subscription engine.
//!
//! One Subscribe stream owns: one inbound channel per subscribed kind fed by
//! the store's publishers, one relay task per kind applying access filtering
//! and backpressure, and one listener task that drives all outbound sends
//! plus the keep-alive tick. The RPC entry task is the unique joiner.
//!
//! Teardown order on every exit path:
//!   mark closing → deregister → (counter decremented by deregistration) →
//!   cancel → join relays → join listener → unregister store sinks → close
//!   the sink. The store can therefore never write into a dropped channel,
//!   and the listener's final control frame always precedes the terminal
//!   close.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{ChangeEvent, ObjectKind, User};
use crate::rbac::{self, PolicyEngine};
use crate::store::{SinkId, Store};
use crate::streaming::frames::{StreamEvent, SubscribeRequest, APPLICATION_UID_FILTER};
use crate::streaming::permission_cache::PermissionCache;
use crate::streaming::registry::{StreamClass, StreamHandle, StreamRegistry};
use crate::streaming::sink::FrameSink;
use crate::AppState;

/// Capacity of each per-kind inbound channel.
pub const KIND_CHANNEL_CAPACITY: usize = 100;
/// Capacity of the listener's consumer channel.
const OUTBOUND_CHANNEL_CAPACITY: usize = 100;
/// Deadline for the timed send into the consumer channel.
const SEND_DEADLINE: Duration = Duration::from_millis(100);
/// Consecutive overflows that force a disconnect.
const OVERFLOW_DISCONNECT_THRESHOLD: u32 = 5;
/// Quiet period after which the overflow counter resets.
const OVERFLOW_RESET_AFTER: Duration = Duration::from_secs(30);
/// Listener keep-alive period.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Overflow accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct OverflowState {
    consecutive: u32,
    is_overflowing: bool,
    last_overflow: Option<Instant>,
}

/// Slow-consumer accounting shared by the relays and the listener.
#[derive(Debug, Default)]
pub struct OverflowTracker {
    state: Mutex<OverflowState>,
}

impl OverflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_overflowing(&self) -> bool {
        self.state.lock().expect("overflow lock").is_overflowing
    }

    fn on_success(&self) {
        let mut state = self.state.lock().expect("overflow lock");
        state.consecutive = 0;
        state.is_overflowing = false;
    }

    /// Record one overflow; returns `true` when the disconnect threshold is
    /// reached. A quiet 30 seconds resets the counter first.
    fn on_overflow(&self) -> bool {
        let mut state = self.state.lock().expect("overflow lock");
        let now = Instant::now();
        if let Some(last) = state.last_overflow {
            if now.duration_since(last) >= OVERFLOW_RESET_AFTER {
                state.consecutive = 0;
            }
        }
        state.consecutive += 1;
        state.is_overflowing = true;
        state.last_overflow = Some(now);
        state.consecutive >= OVERFLOW_DISCONNECT_THRESHOLD
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ForwardOutcome {
    Sent,
    Dropped,
    Disconnect,
}

/// Tri-state send into the consumer channel.
///
/// Not overflowing: non-blocking try, then a 100 ms timed send, then
/// overflow. While overflowing only the non-blocking try is attempted, so
/// the per-kind channel (and through it the store's publisher) is never
/// held up; a success clears the flag.
async fn forward_event(
    out_tx: &mpsc::Sender<StreamEvent>,
    event: StreamEvent,
    overflow: &OverflowTracker,
) -> ForwardOutcome {
    if overflow.is_overflowing() {
        return match out_tx.try_send(event) {
            Ok(()) => {
                overflow.on_success();
                ForwardOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if overflow.on_overflow() {
                    ForwardOutcome::Disconnect
                } else {
                    ForwardOutcome::Dropped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => ForwardOutcome::Disconnect,
        };
    }

    match out_tx.try_send(event) {
        Ok(()) => {
            overflow.on_success();
            ForwardOutcome::Sent
        }
        Err(mpsc::error::TrySendError::Closed(_)) => ForwardOutcome::Disconnect,
        Err(mpsc::error::TrySendError::Full(event)) => {
            match tokio::time::timeout(SEND_DEADLINE, out_tx.send(event)).await {
                Ok(Ok(())) => {
                    overflow.on_success();
                    ForwardOutcome::Sent
                }
                Ok(Err(_)) => ForwardOutcome::Disconnect,
                Err(_) => {
                    if overflow.on_overflow() {
                        ForwardOutcome::Disconnect
                    } else {
                        ForwardOutcome::Dropped
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Relay & listener tasks
// ---------------------------------------------------------------------------

struct RelayContext {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
    cache: Arc<PermissionCache>,
    user: User,
    kinds: Arc<HashSet<ObjectKind>>,
    application_filter: Option<Uuid>,
    out_tx: mpsc::Sender<StreamEvent>,
    overflow: Arc<OverflowTracker>,
    handle: Arc<StreamHandle>,
}

/// One relay per subscribed kind: read from the per-kind channel, filter,
/// forward under the backpressure discipline.
async fn run_relay(ctx: RelayContext, mut rx: mpsc::Receiver<ChangeEvent>) {
    loop {
        let event = tokio::select! {
            _ = ctx.handle.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if ctx.handle.is_closing() {
            continue;
        }
        // Defensive: the per-kind channel is the primary filter.
        if !ctx.kinds.contains(&event.object_kind) {
            continue;
        }
        if let Some(filter_uid) = ctx.application_filter {
            if event.object_kind.is_application_scoped()
                && event.application_uid() != Some(filter_uid)
            {
                continue;
            }
        }
        if !event_visible(&ctx, &event).await {
            continue;
        }

        match forward_event(&ctx.out_tx, StreamEvent::data(&event), &ctx.overflow).await {
            ForwardOutcome::Sent | ForwardOutcome::Dropped => {}
            ForwardOutcome::Disconnect => {
                tracing::warn!(
                    id = %ctx.handle.id,
                    kind = %event.object_kind,
                    "Slow consumer exceeded overflow threshold, disconnecting"
                );
                ctx.handle.cancel.cancel();
                break;
            }
        }
    }
}

/// Per-event access: application-scoped kinds require ownership or the
/// elevated `*_all` grant (memoized); everything else was covered by the
/// subscribe pre-check.
async fn event_visible(ctx: &RelayContext, event: &ChangeEvent) -> bool {
    if !event.object_kind.is_application_scoped() {
        return true;
    }
    let Some(app_uid) = event.application_uid() else {
        return false;
    };
    let Some(all_method) = rbac::event_all_method(event.object_kind) else {
        return false;
    };
    ctx.cache
        .check(&ctx.store, &ctx.policy, &ctx.user, app_uid, all_method)
        .await
}

/// The single owner of outbound sends: drains the consumer channel, ticks
/// the keep-alive, and emits the final control frame on exit.
async fn run_listener(
    handle: Arc<StreamHandle>,
    mut out_rx: mpsc::Receiver<StreamEvent>,
    overflow: Arc<OverflowTracker>,
) {
    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_PERIOD,
        KEEP_ALIVE_PERIOD,
    );

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = keep_alive.tick() => {
                if handle.sink.send(&StreamEvent::keep_alive()).await.is_err() {
                    handle.cancel.cancel();
                    break;
                }
            }
            event = out_rx.recv() => match event {
                None => break,
                Some(event) => {
                    if handle.sink.send(&event).await.is_err() {
                        handle.cancel.cancel();
                        break;
                    }
                }
            }
        }
    }

    let final_frame = if overflow.is_overflowing() {
        StreamEvent::error(&ApiError::ResourceExhausted(
            "subscription overflowed, events were dropped".to_string(),
        ))
    } else {
        StreamEvent::removed()
    };
    if let Err(err) = handle.sink.send(&final_frame).await {
        tracing::debug!(id = %handle.id, "Final subscription frame dropped: {}", err);
    }
}

// ---------------------------------------------------------------------------
// Subscription lifetime
// ---------------------------------------------------------------------------

pub struct SubscriptionSpec {
    pub kinds: HashSet<ObjectKind>,
    pub application_filter: Option<Uuid>,
}

impl SubscriptionSpec {
    /// Validate the wire request: at least one concrete kind, and the
    /// optional `application_uid` filter must parse.
    pub fn from_request(request: SubscribeRequest) -> Result<Self, ApiError> {
        let kinds: HashSet<ObjectKind> = request
            .subscription_types
            .into_iter()
            .filter(|k| *k != ObjectKind::Unspecified)
            .collect();
        if kinds.is_empty() {
            return Err(ApiError::InvalidArgument(
                "subscription_types must name at least one object kind".to_string(),
            ));
        }
        let application_filter = match request.filters.get(APPLICATION_UID_FILTER) {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
                ApiError::InvalidArgument(format!("malformed {} filter", APPLICATION_UID_FILTER))
            })?),
            None => None,
        };
        Ok(SubscriptionSpec {
            kinds,
            application_filter,
        })
    }
}

/// A running subscription: relays, listener and store registrations, owned
/// and joined by the RPC entry task.
pub struct Subscription {
    handle: Arc<StreamHandle>,
    relay_handles: Vec<JoinHandle<()>>,
    listener_handle: JoinHandle<()>,
    registrations: Vec<(ObjectKind, SinkId)>,
    store: Arc<Store>,
    registry: Arc<StreamRegistry>,
}

impl Subscription {
    /// Wire the subscription up: per-kind channels, store registration, the
    /// confirmation frame, then the relay and listener tasks. The handle
    /// must already be admitted to the registry.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        store: Arc<Store>,
        policy: Arc<PolicyEngine>,
        cache: Arc<PermissionCache>,
        registry: Arc<StreamRegistry>,
        handle: Arc<StreamHandle>,
        user: User,
        spec: SubscriptionSpec,
    ) -> Result<Subscription, ApiError> {
        let kinds = Arc::new(spec.kinds);

        let mut registrations = Vec::new();
        let mut kind_channels = Vec::new();
        for kind in kinds.iter().copied() {
            let (tx, rx) = mpsc::channel(KIND_CHANNEL_CAPACITY);
            let sink_id = store.subscribe(kind, tx).await;
            registrations.push((kind, sink_id));
            kind_channels.push(rx);
        }

        // Confirmation-of-readiness precedes any data frame: relays have
        // not been spawned yet.
        handle.sink.send(&StreamEvent::opened(&handle.id)).await?;

        let overflow = Arc::new(OverflowTracker::new());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let relay_handles = kind_channels
            .into_iter()
            .map(|rx| {
                let ctx = RelayContext {
                    store: store.clone(),
                    policy: policy.clone(),
                    cache: cache.clone(),
                    user: user.clone(),
                    kinds: kinds.clone(),
                    application_filter: spec.application_filter,
                    out_tx: out_tx.clone(),
                    overflow: overflow.clone(),
                    handle: handle.clone(),
                };
                tokio::spawn(run_relay(ctx, rx))
            })
            .collect();

        let listener_handle = tokio::spawn(run_listener(
            handle.clone(),
            out_rx,
            overflow.clone(),
        ));

        Ok(Subscription {
            handle,
            relay_handles,
            listener_handle,
            registrations,
            store,
            registry,
        })
    }

    pub fn handle(&self) -> Arc<StreamHandle> {
        self.handle.clone()
    }

    /// Ordered teardown; safe to reach from any exit path.
    pub async fn finish(self) {
        self.handle.mark_closing();
        self.registry.remove(&self.handle).await;
        self.handle.cancel.cancel();

        for relay in self.relay_handles {
            let _ = relay.await;
        }
        let _ = self.listener_handle.await;

        for (kind, sink_id) in self.registrations {
            self.store.unsubscribe(kind, sink_id).await;
        }
        self.handle.sink.close().await;
        tracing::debug!(id = %self.handle.id, "Subscription closed");
    }
}

// ---------------------------------------------------------------------------
// WebSocket entry point
// ---------------------------------------------------------------------------

/// Drive one Subscribe stream from upgrade to teardown.
pub async fn run_subscription(state: AppState, user: User, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let sink = FrameSink::new(ws_tx);

    // The first client frame carries the subscribe request.
    let spec = match read_subscribe_request(&mut ws_rx).await {
        Ok(spec) => spec,
        Err(err) => {
            let _ = sink.send(&StreamEvent::error(&err)).await;
            sink.close().await;
            return;
        }
    };

    // Base subscribe permission per requested kind; any miss rejects the
    // whole subscription.
    for kind in &spec.kinds {
        let allowed = match rbac::subscribe_permission(*kind) {
            Some((service, method)) => {
                state
                    .policy
                    .check_permission(&user.roles, service, method)
                    .await
            }
            None => false,
        };
        if !allowed {
            let err =
                ApiError::PermissionDenied(format!("subscription to {} not permitted", kind));
            let _ = sink.send(&StreamEvent::error(&err)).await;
            sink.close().await;
            return;
        }
    }

    let node_uid = state
        .store
        .node_this()
        .await
        .map(|n| n.uid.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let id = format!(
        "{}-{}-{}",
        user.name,
        node_uid,
        state.streams.next_subscription_seq()
    );
    let handle = StreamHandle::new(
        id,
        user.name.clone(),
        StreamClass::Subscribe,
        sink.clone(),
        CancellationToken::new(),
    );

    let limit = user.streams_limit(state.settings.limits.default_streams_limit);
    if let Err(err) = state.streams.register(handle.clone(), limit).await {
        let _ = sink.send(&StreamEvent::error(&err)).await;
        sink.close().await;
        return;
    }

    let subscription = match Subscription::start(
        state.store.clone(),
        state.policy.clone(),
        state.permission_cache.clone(),
        state.streams.clone(),
        handle.clone(),
        user,
        spec,
    )
    .await
    {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::debug!(id = %handle.id, "Subscription setup failed: {}", err);
            handle.mark_closing();
            state.streams.remove(&handle).await;
            handle.cancel.cancel();
            sink.close().await;
            return;
        }
    };

    tracing::info!(id = %handle.id, "Subscription opened");

    // Wait for client disconnect or any cancellation source.
    tokio::select! {
        _ = handle.cancel.cancelled() => {}
        _ = drain_until_close(&mut ws_rx) => {}
    }

    subscription.finish().await;
}

async fn read_subscribe_request(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
) -> Result<SubscriptionSpec, ApiError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let request: SubscribeRequest = serde_json::from_str(&text)
                    .map_err(|e| ApiError::InvalidArgument(format!("malformed subscribe request: {}", e)))?;
                return SubscriptionSpec::from_request(request);
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ApiError::InvalidArgument(
                    "stream closed before subscribe request".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ApiError::Unavailable(format!("transport error: {}", e)))
            }
        }
    }
}

/// Consume the read half until the client goes away.
async fn drain_until_close(ws_rx: &mut futures::stream::SplitStream<WebSocket>) {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
}
