//! Shared outbound writer.
//!
//! One WebSocket write half serves a whole stream: per-request workers, the
//! keep-alive tick, relays via the listener, and the shutdown coordinator
//! all send through a [`FrameSink`]. The async mutex serializes frames on
//! the single transport; the `closed` flag is checked under the same lock,
//! so a send after close returns an error instead of touching a dead socket.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ApiError;

enum Transport {
    Ws(SplitSink<WebSocket, Message>),
    /// Captures frames instead of writing to a socket; tests only.
    #[cfg(test)]
    Buffer(Vec<String>),
}

struct SinkState {
    transport: Transport,
    closed: bool,
}

pub struct FrameSink {
    inner: Mutex<SinkState>,
}

impl FrameSink {
    pub fn new(ws: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(FrameSink {
            inner: Mutex::new(SinkState {
                transport: Transport::Ws(ws),
                closed: false,
            }),
        })
    }

    #[cfg(test)]
    pub fn buffered() -> Arc<Self> {
        Arc::new(FrameSink {
            inner: Mutex::new(SinkState {
                transport: Transport::Buffer(Vec::new()),
                closed: false,
            }),
        })
    }

    /// Hold the writer lock for a while, so concurrent senders block the
    /// way they would on a congested transport; tests only.
    #[cfg(test)]
    pub async fn stall_for_test(&self, duration: std::time::Duration) {
        let _state = self.inner.lock().await;
        tokio::time::sleep(duration).await;
    }

    /// Frames captured by a buffered sink, in send order.
    #[cfg(test)]
    pub async fn sent_frames(&self) -> Vec<String> {
        match &self.inner.lock().await.transport {
            Transport::Buffer(frames) => frames.clone(),
            Transport::Ws(_) => Vec::new(),
        }
    }

    /// Serialize and send one frame. Fails with `Unavailable` once the sink
    /// is closed or the transport has gone away.
    pub async fn send<T: Serialize>(&self, frame: &T) -> Result<(), ApiError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ApiError::Internal(format!("frame serialization failed: {}", e)))?;

        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(ApiError::Unavailable("stream is closed".to_string()));
        }
        match &mut state.transport {
            Transport::Ws(ws) => ws
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| ApiError::Unavailable(format!("transport error: {}", e))),
            #[cfg(test)]
            Transport::Buffer(frames) => {
                frames.push(text);
                Ok(())
            }
        }
    }

    /// Terminal close: mark closed and send the WebSocket close frame.
    /// Idempotent; later `send` calls return errors.
    pub async fn close(&self) {
        let mut state = self.inner.lock().await;
        if !state.closed {
            state.closed = true;
            if let Transport::Ws(ws) = &mut state.transport {
                let _ = ws.send(Message::Close(None)).await;
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_after_close_returns_error() {
        let sink = FrameSink::buffered();
        sink.send(&serde_json::json!({"a": 1})).await.unwrap();
        sink.close().await;

        let err = sink.send(&serde_json::json!({"b": 2})).await.unwrap_err();
        assert_eq!(err.code_name(), "Unavailable");
        assert_eq!(sink.sent_frames().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sink = FrameSink::buffered();
        sink.close().await;
        sink.close().await;
        assert!(sink.is_closed().await);
    }
}
