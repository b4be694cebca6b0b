//! Dedup gate: an atomic check-and-reserve against a shared cache, keyed by
//! the SHA-256 of the canonical link.
//!
//! A reserved key blocks the link until its TTL runs out. After that the
//! same link may enter the pipeline again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::info;

use crate::error::Result;

const SENTINEL: &str = "exists";

/// Hex-encoded SHA-256 of a canonical link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(link: &str) -> Self {
        Self(hex::encode(Sha256::digest(link.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache capable of a single-round-trip set-if-absent with expiry.
#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Returns `true` if the key was absent and is now reserved for `ttl`.
    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Redis-backed cache. `SET key exists NX EX ttl` keeps check and set atomic.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect and ping; an unreachable cache fails here rather than on the
    /// first poll.
    pub async fn connect(addr: &str) -> Result<Self> {
        let addr = if addr.contains("://") {
            addr.to_owned()
        } else {
            format!("redis://{addr}")
        };
        let client = redis::Client::open(addr.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(addr = %addr, "connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl DedupCache for RedisCache {
    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(SENTINEL)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// Process-local cache with the same contract, driven by the tokio clock.
/// Expired keys are dropped on the next reservation.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|expiry| **expiry > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupCache for MemoryCache {
    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, expiry| *expiry > now);
        match entries.get(key) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                entries.insert(key.to_owned(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[derive(Clone)]
pub struct DedupGate {
    cache: Arc<dyn DedupCache>,
    ttl: Duration,
}

impl DedupGate {
    pub fn new(cache: Arc<dyn DedupCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `true` exactly once per link within the TTL window; the caller may
    /// proceed. `false` means the link was already reserved and must be skipped.
    pub async fn check_and_reserve(&self, link: &str) -> Result<bool> {
        let key = ContentHash::of(link);
        self.cache.reserve(key.as_str(), self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_fixed_length_hex() {
        let h = ContentHash::of("https://x/a");
        assert_eq!(h.as_str().len(), 64);
        assert!(h.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(h, ContentHash::of("https://x/a"));
        assert_ne!(h, ContentHash::of("https://x/b"));
    }

    #[test]
    fn hash_matches_known_digest() {
        assert_eq!(
            ContentHash::of("abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_once_per_window_then_again_after_expiry() {
        let gate = DedupGate::new(Arc::new(MemoryCache::new()), Duration::from_secs(86_400));

        assert!(gate.check_and_reserve("https://x/a").await.unwrap());
        assert!(!gate.check_and_reserve("https://x/a").await.unwrap());
        assert!(gate.check_and_reserve("https://x/b").await.unwrap());

        tokio::time::advance(Duration::from_secs(86_399)).await;
        assert!(!gate.check_and_reserve("https://x/a").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(gate.check_and_reserve("https://x/a").await.unwrap());
        assert!(!gate.check_and_reserve("https://x/a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_pruned() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        for i in 0..10 {
            assert!(cache.reserve(&format!("k{i}"), ttl).await.unwrap());
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.reserve("fresh", ttl).await.unwrap());
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_reservations_admit_one_caller() {
        let cache = Arc::new(MemoryCache::new());
        let gate = DedupGate::new(cache.clone(), Duration::from_secs(60));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                gate.check_and_reserve("https://x/same").await.unwrap()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(cache.len(), 1);
    }
}
