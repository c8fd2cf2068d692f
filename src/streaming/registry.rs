//! Stream registries and the shutdown coordinator.
//!
//! Every live Connect and Subscribe stream is registered here exactly once.
//! The registry owns the per-user per-class counters and is the single
//! decrement point: removal is idempotent, so an eviction racing a normal
//! teardown can never double-count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::streaming::frames::{ResponseFrame, StreamEvent};
use crate::streaming::sink::FrameSink;

/// Stream classes are counted and limited independently per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamClass {
    Connect,
    Subscribe,
}

impl StreamClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamClass::Connect => "connect",
            StreamClass::Subscribe => "subscribe",
        }
    }
}

/// Registered state shared by a stream's tasks and the registry.
pub struct StreamHandle {
    pub id: String,
    pub user_name: String,
    pub class: StreamClass,
    pub sink: Arc<FrameSink>,
    pub cancel: CancellationToken,
    /// Set first on any teardown path; producers stop enqueuing once
    /// observed. The sink's own `closed` flag is terminal and set last.
    pub closing: AtomicBool,
    pub opened_at: Instant,
}

impl StreamHandle {
    pub fn new(
        id: String,
        user_name: String,
        class: StreamClass,
        sink: Arc<FrameSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(StreamHandle {
            id,
            user_name,
            class,
            sink,
            cancel,
            closing: AtomicBool::new(false),
            opened_at: Instant::now(),
        })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

pub struct StreamRegistry {
    connections: RwLock<HashMap<String, Arc<StreamHandle>>>,
    subscriptions: RwLock<HashMap<String, Arc<StreamHandle>>>,
    counters: RwLock<HashMap<(String, StreamClass), usize>>,
    shutting_down: AtomicBool,
    subscription_seq: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(StreamRegistry {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            subscription_seq: AtomicU64::new(1),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Monotonic sequence for subscription ids.
    pub fn next_subscription_seq(&self) -> u64 {
        self.subscription_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn map_for(&self, class: StreamClass) -> &RwLock<HashMap<String, Arc<StreamHandle>>> {
        match class {
            StreamClass::Connect => &self.connections,
            StreamClass::Subscribe => &self.subscriptions,
        }
    }

    /// Admit a new stream, enforcing the user's per-class limit:
    /// `-1` unlimited, `0` reject, at capacity the oldest stream of the
    /// class is evicted first.
    pub async fn register(&self, handle: Arc<StreamHandle>, limit: i32) -> Result<(), ApiError> {
        if self.is_shutting_down() {
            return Err(ApiError::Unavailable("server is draining".to_string()));
        }
        if limit == 0 {
            return Err(ApiError::ResourceExhausted(format!(
                "{} streams are not allowed for this user",
                handle.class.as_str()
            )));
        }

        if limit > 0 {
            loop {
                let current = self.count(&handle.user_name, handle.class).await;
                if current < limit as usize {
                    break;
                }
                let oldest = self.oldest(&handle.user_name, handle.class).await;
                match oldest {
                    Some(old) => self.evict(old).await,
                    None => break,
                }
            }
        }

        self.map_for(handle.class)
            .write()
            .await
            .insert(handle.id.clone(), handle.clone());
        *self
            .counters
            .write()
            .await
            .entry((handle.user_name.clone(), handle.class))
            .or_insert(0) += 1;

        tracing::debug!(
            id = %handle.id,
            class = handle.class.as_str(),
            "Stream registered"
        );
        Ok(())
    }

    /// Deregister a stream. Idempotent; decrements the user's counter only
    /// when the handle was actually present.
    pub async fn remove(&self, handle: &StreamHandle) -> bool {
        let removed = self
            .map_for(handle.class)
            .write()
            .await
            .remove(&handle.id)
            .is_some();
        if removed {
            let mut counters = self.counters.write().await;
            let key = (handle.user_name.clone(), handle.class);
            if let Some(count) = counters.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counters.remove(&key);
                }
            }
        }
        removed
    }

    pub async fn count(&self, user_name: &str, class: StreamClass) -> usize {
        self.counters
            .read()
            .await
            .get(&(user_name.to_string(), class))
            .copied()
            .unwrap_or(0)
    }

    async fn oldest(&self, user_name: &str, class: StreamClass) -> Option<Arc<StreamHandle>> {
        self.map_for(class)
            .read()
            .await
            .values()
            .filter(|h| h.user_name == user_name)
            .min_by_key(|h| h.opened_at)
            .cloned()
    }

    /// Push out one stream to make room: notify, mark closing, deregister,
    /// then cancel. Its entry task finishes the unwind.
    async fn evict(&self, handle: Arc<StreamHandle>) {
        tracing::info!(
            id = %handle.id,
            class = handle.class.as_str(),
            "Evicting oldest stream for user over limit"
        );
        let notify = match handle.class {
            StreamClass::Connect => handle.sink.send(&ResponseFrame::stream_limit_exceeded()).await,
            StreamClass::Subscribe => handle.sink.send(&StreamEvent::limit_exceeded()).await,
        };
        if let Err(err) = notify {
            tracing::debug!(id = %handle.id, "Eviction notification dropped: {}", err);
        }
        handle.mark_closing();
        self.remove(&handle).await;
        handle.cancel.cancel();
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    // -----------------------------------------------------------------
    // Shutdown coordination
    // -----------------------------------------------------------------

    /// Drain all streams: reject newcomers, notify and cancel everything
    /// live, then poll until both registries empty or the deadline fires,
    /// force-closing stragglers.
    pub async fn graceful_shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        let subscriptions: Vec<_> = self.subscriptions.read().await.values().cloned().collect();
        tracing::info!(
            connections = connections.len(),
            subscriptions = subscriptions.len(),
            "Draining streams"
        );

        for conn in connections {
            if let Err(err) = conn.sink.send(&ResponseFrame::server_shutdown()).await {
                tracing::debug!(id = %conn.id, "Shutdown notification dropped: {}", err);
            }
            conn.mark_closing();
            conn.cancel.cancel();
        }
        for sub in subscriptions {
            // The listener emits the final REMOVED frame on its way out.
            sub.mark_closing();
            sub.cancel.cancel();
        }

        let started = Instant::now();
        loop {
            if self.connection_count().await == 0 && self.subscription_count().await == 0 {
                tracing::info!("All streams drained");
                return;
            }
            if started.elapsed() >= deadline {
                tracing::warn!("Drain deadline exceeded, force-closing remaining streams");
                self.force_close().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drop everything immediately and clear the counters.
    async fn force_close(&self) {
        for map in [&self.connections, &self.subscriptions] {
            let drained: Vec<_> = map.write().await.drain().map(|(_, h)| h).collect();
            for handle in drained {
                handle.mark_closing();
                handle.cancel.cancel();
            }
        }
        self.counters.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::frames::STREAM_LIMIT_ID;

    fn handle(registry: &StreamRegistry, user: &str, class: StreamClass) -> Arc<StreamHandle> {
        StreamHandle::new(
            format!("{}-{}", user, registry.next_subscription_seq()),
            user.to_string(),
            class,
            FrameSink::buffered(),
            CancellationToken::new(),
        )
    }

    /// Mimic the RPC entry task: when the stream is cancelled, deregister.
    fn spawn_entry_task(registry: Arc<StreamRegistry>, h: Arc<StreamHandle>) {
        tokio::spawn(async move {
            h.cancel.cancelled().await;
            h.mark_closing();
            registry.remove(&h).await;
        });
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_every_admission() {
        let registry = StreamRegistry::new();
        let h = handle(&registry, "alice", StreamClass::Connect);
        let err = registry.register(h, 0).await.unwrap_err();
        assert_eq!(err.code_name(), "ResourceExhausted");
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 0);
    }

    #[tokio::test]
    async fn test_unlimited_never_evicts() {
        let registry = StreamRegistry::new();
        for _ in 0..10 {
            registry
                .register(handle(&registry, "alice", StreamClass::Subscribe), -1)
                .await
                .unwrap();
        }
        assert_eq!(registry.count("alice", StreamClass::Subscribe).await, 10);
        assert_eq!(registry.subscription_count().await, 10);
    }

    #[tokio::test]
    async fn test_over_limit_evicts_oldest_with_notification() {
        let registry = StreamRegistry::new();
        let first = handle(&registry, "alice", StreamClass::Connect);
        let second = handle(&registry, "alice", StreamClass::Connect);
        registry.register(first.clone(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.register(second.clone(), 1).await.unwrap();

        // The oldest got the notification, is cancelled and gone; the new
        // one is live; the counter still reads one.
        assert!(first.cancel.is_cancelled());
        assert!(first.is_closing());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 1);

        let frames = first.sink.sent_frames().await;
        assert_eq!(frames.len(), 1);
        let frame: crate::streaming::frames::ResponseFrame =
            serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame.request_id, STREAM_LIMIT_ID);
        assert_eq!(
            frame.error.as_ref().map(|e| e.code.as_str()),
            Some("ResourceExhausted")
        );
    }

    #[tokio::test]
    async fn test_classes_are_counted_independently() {
        let registry = StreamRegistry::new();
        let conn = handle(&registry, "alice", StreamClass::Connect);
        let sub = handle(&registry, "alice", StreamClass::Subscribe);
        registry.register(conn.clone(), 1).await.unwrap();
        registry.register(sub, 1).await.unwrap();

        // Neither evicted the other.
        assert!(!conn.cancel.is_cancelled());
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 1);
        assert_eq!(registry.count("alice", StreamClass::Subscribe).await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_decrements_once() {
        let registry = StreamRegistry::new();
        let h = handle(&registry, "alice", StreamClass::Connect);
        registry.register(h.clone(), -1).await.unwrap();

        assert!(registry.remove(&h).await);
        assert!(!registry.remove(&h).await);
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_and_rejects_newcomers() {
        let registry = StreamRegistry::new();

        let mut connections = Vec::new();
        for _ in 0..3 {
            let h = handle(&registry, "alice", StreamClass::Connect);
            registry.register(h.clone(), -1).await.unwrap();
            spawn_entry_task(registry.clone(), h.clone());
            connections.push(h);
        }
        let mut subscriptions = Vec::new();
        for _ in 0..2 {
            let h = handle(&registry, "bob", StreamClass::Subscribe);
            registry.register(h.clone(), -1).await.unwrap();
            spawn_entry_task(registry.clone(), h.clone());
            subscriptions.push(h);
        }

        registry.graceful_shutdown(Duration::from_secs(5)).await;

        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.subscription_count().await, 0);
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 0);
        assert_eq!(registry.count("bob", StreamClass::Subscribe).await, 0);

        for conn in &connections {
            let frames = conn.sink.sent_frames().await;
            let frame: crate::streaming::frames::ResponseFrame =
                serde_json::from_str(&frames[0]).unwrap();
            assert_eq!(frame.response_type, "ServerShutdownNotification");
            assert_eq!(
                frame.error.as_ref().map(|e| e.code.as_str()),
                Some("Unavailable")
            );
        }

        // Newcomers are rejected while draining.
        let late = handle(&registry, "carol", StreamClass::Connect);
        let err = registry.register(late, -1).await.unwrap_err();
        assert_eq!(err.code_name(), "Unavailable");
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_stragglers() {
        let registry = StreamRegistry::new();
        // No entry task: nothing will deregister this stream voluntarily.
        let h = handle(&registry, "alice", StreamClass::Connect);
        registry.register(h.clone(), -1).await.unwrap();

        registry.graceful_shutdown(Duration::from_millis(300)).await;

        assert!(h.cancel.is_cancelled());
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.count("alice", StreamClass::Connect).await, 0);
    }
}
