//! Token-bucket rate limiting.
//!
//! Two independent keyed limiters with one `allow(key) → bool` contract:
//!
//!   * [`AddrRateLimiter`] – keyed by remote network address, consulted only
//!     after authentication has failed (default 10 req/min).
//!   * [`UserRateLimiter`] – keyed by user name, consulted after
//!     authentication (default 60 req/min, overridable per user).
//!
//! Each unique key gets its own governor bucket; idle buckets are evicted by
//! a background sweeper.

use std::{collections::HashMap, net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

use axum::extract::Request;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::RwLock;

type Bucket = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

fn quota_per_minute(requests: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN))
}

// ---------------------------------------------------------------------------
// Address-keyed limiter (unauthenticated traffic)
// ---------------------------------------------------------------------------

/// Per-address limiter for failed-auth traffic.
#[derive(Clone)]
pub struct AddrRateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    quota: Quota,
    sweep_interval: Duration,
}

impl AddrRateLimiter {
    pub fn new(requests_per_minute: u32, sweep_interval: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            quota: quota_per_minute(requests_per_minute),
            sweep_interval,
        }
    }

    /// `true` if the request from `addr` is within its budget.
    pub async fn allow(&self, addr: &str) -> bool {
        // Fast path: existing bucket under the read lock.
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(addr) {
                return bucket.check().is_ok();
            }
        }

        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)));
        bucket.check().is_ok()
    }

    /// Drop buckets with spare capacity: an address that is still being
    /// throttled keeps its bucket, everyone else starts fresh next time.
    pub async fn sweep(&self) {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_addr, bucket| bucket.check().is_err());
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(
                "Unauth limiter sweep: removed {} idle buckets, {} remaining",
                removed,
                buckets.len()
            );
        }
    }

    pub fn spawn_sweeper(self) -> tokio::task::JoinHandle<()> {
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// User-keyed limiter (authenticated traffic)
// ---------------------------------------------------------------------------

/// Per-user limiter. The bucket quota is fixed when the user's first request
/// creates the bucket, using the per-user override when one is configured.
#[derive(Clone)]
pub struct UserRateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    default_quota: Quota,
    sweep_interval: Duration,
}

impl UserRateLimiter {
    pub fn new(default_requests_per_minute: u32, sweep_interval: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            default_quota: quota_per_minute(default_requests_per_minute),
            sweep_interval,
        }
    }

    pub async fn allow(&self, user_name: &str, requests_per_minute: Option<u32>) -> bool {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(user_name) {
                return bucket.check().is_ok();
            }
        }

        let quota = requests_per_minute
            .map(quota_per_minute)
            .unwrap_or(self.default_quota);
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(user_name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)));
        bucket.check().is_ok()
    }

    pub async fn sweep(&self) {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_user, bucket| bucket.check().is_err());
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(
                "User limiter sweep: removed {} idle buckets, {} remaining",
                removed,
                buckets.len()
            );
        }
    }

    pub fn spawn_sweeper(self) -> tokio::task::JoinHandle<()> {
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Client address extraction
// ---------------------------------------------------------------------------

/// Extract the client address for limiter keying.
///
/// Checks (in order):
/// 1. `X-Forwarded-For` header (first entry, set by the reverse proxy)
/// 2. `X-Real-Ip` header
/// 3. The connected peer address from the connection info
/// 4. Falls back to 127.0.0.1
pub fn extract_client_addr(request: &Request) -> String {
    if let Some(xff) = request.headers().get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first) = xff_str.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }

    if let Some(xri) = request.headers().get("x-real-ip") {
        if let Ok(xri_str) = xri.to_str() {
            if let Ok(ip) = xri_str.trim().parse::<IpAddr>() {
                return ip.to_string();
            }
        }
    }

    if let Some(connect_info) = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return connect_info.0.ip().to_string();
    }

    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_addr_limiter_blocks_after_budget() {
        let limiter = AddrRateLimiter::new(10, Duration::from_secs(600));

        for i in 0..10 {
            assert!(limiter.allow("10.0.0.1").await, "request {} should pass", i);
        }
        assert!(!limiter.allow("10.0.0.1").await, "11th request should block");

        // Another address has its own bucket.
        assert!(limiter.allow("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_user_limiter_honors_override() {
        let limiter = UserRateLimiter::new(60, Duration::from_secs(600));

        for _ in 0..2 {
            assert!(limiter.allow("alice", Some(2)).await);
        }
        assert!(!limiter.allow("alice", Some(2)).await);

        // Default quota user is unaffected.
        assert!(limiter.allow("bob", None).await);
    }

    #[tokio::test]
    async fn test_addr_sweep_drops_idle_buckets() {
        let limiter = AddrRateLimiter::new(10, Duration::from_secs(600));
        limiter.allow("10.0.0.1").await;
        // The bucket still has spare capacity, so the sweep reclaims it.
        limiter.sweep().await;
        assert!(limiter.buckets.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_throttled_bucket_survives_sweep() {
        let limiter = AddrRateLimiter::new(1, Duration::from_secs(600));
        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);
        limiter.sweep().await;
        assert_eq!(limiter.buckets.read().await.len(), 1);
    }
}
