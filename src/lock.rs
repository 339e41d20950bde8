//! Per-key download locks and the global LRU read/write lock.
//!
//! Two flavors implement the same narrow trait pair: [`LocalLocker`]/
//! [`LocalRwLocker`] keep an in-process registry GC'd on release;
//! [`RedisLocker`]/[`RedisRwLocker`] coordinate across instances with a
//! fencing token, a TTL, and renewal, falling back to the local flavor
//! only when `allow_degraded_mode` is set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::AsyncCommands;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock acquisition exceeded {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("lock lost to a competing owner (fencing token mismatch)")]
    FencingLost,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

async fn backoff_sleep(attempt: u32, config: &RetryConfig) {
    let base = config.initial_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = base.min(config.max_delay.as_millis() as u64);
    let jittered = capped as f64 * (1.0 + rand::thread_rng().gen_range(-config.jitter..=config.jitter));
    tokio::time::sleep(Duration::from_millis(jittered.max(0.0) as u64)).await;
}

/// A held per-key lock; dropping it releases the key.
pub trait LockGuard: Send {}

/// Per-key mutual exclusion, keyed by an arbitrary string (a NARInfo hash
/// or a NAR URL hash).
#[async_trait]
pub trait Locker: Send + Sync + std::fmt::Debug {
    async fn lock(&self, key: &str) -> Result<Box<dyn LockGuard>, LockError>;
}

/// A single global read/write lock: readers are concurrent downloads
/// persisting an artifact, the writer is the LRU job.
#[async_trait]
pub trait RwLocker: Send + Sync + std::fmt::Debug {
    async fn read(&self) -> Result<Box<dyn LockGuard>, LockError>;
    async fn write(&self) -> Result<Box<dyn LockGuard>, LockError>;
}

// --- local, in-process ------------------------------------------------

struct OwnedMutexGuard(#[allow(dead_code)] tokio::sync::OwnedMutexGuard<()>);
impl LockGuard for OwnedMutexGuard {}

/// In-process per-key mutex registry. Entries are garbage collected when
/// the last holder drops its `Arc`.
#[derive(Clone, Debug, Default)]
pub struct LocalLocker {
    registry: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LocalLocker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut registry = self.registry.lock().await;
        registry
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops registry entries with no outstanding holder. Call
    /// periodically; a long-lived registry otherwise grows unboundedly.
    pub async fn gc(&self) {
        let mut registry = self.registry.lock().await;
        registry.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&self, key: &str) -> Result<Box<dyn LockGuard>, LockError> {
        let mutex = self.entry(key).await;
        let guard = mutex.lock_owned().await;
        Ok(Box::new(OwnedMutexGuard(guard)))
    }
}

struct OwnedRwReadGuard(#[allow(dead_code)] OwnedRwLockReadGuard<()>);
impl LockGuard for OwnedRwReadGuard {}
struct OwnedRwWriteGuard(#[allow(dead_code)] OwnedRwLockWriteGuard<()>);
impl LockGuard for OwnedRwWriteGuard {}

#[derive(Clone, Debug)]
pub struct LocalRwLocker {
    lock: Arc<RwLock<()>>,
}

impl LocalRwLocker {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
        }
    }
}

impl Default for LocalRwLocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RwLocker for LocalRwLocker {
    async fn read(&self) -> Result<Box<dyn LockGuard>, LockError> {
        Ok(Box::new(OwnedRwReadGuard(self.lock.clone().read_owned().await)))
    }

    async fn write(&self) -> Result<Box<dyn LockGuard>, LockError> {
        Ok(Box::new(OwnedRwWriteGuard(self.lock.clone().write_owned().await)))
    }
}

// --- distributed, Redis-backed -----------------------------------------

/// A fencing token guard: on drop, best-effort releases the key if we
/// still own it (compare-and-delete via a Lua script).
pub struct RedisLockGuard {
    conn: redis::aio::ConnectionManager,
    key: String,
    token: String,
}
impl LockGuard for RedisLockGuard {}

impl Drop for RedisLockGuard {
    fn drop(&mut self) {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let _: Result<(), _> = release_script()
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
        });
    }
}

fn release_script() -> redis::Script {
    redis::Script::new(
        r"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('del', KEYS[1])
        else
            return 0
        end
        ",
    )
}

#[derive(Clone, Debug)]
pub struct RedisLocker {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    retry: RetryConfig,
    degraded: Option<LocalLocker>,
}

impl RedisLocker {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        key_prefix: String,
        ttl: Duration,
        retry: RetryConfig,
        allow_degraded_mode: bool,
    ) -> Self {
        Self {
            conn,
            key_prefix,
            ttl,
            retry,
            degraded: allow_degraded_mode.then(LocalLocker::new),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn lock(&self, key: &str) -> Result<Box<dyn LockGuard>, LockError> {
        let full_key = self.full_key(key);
        let token: String = uuid_like_token();

        let mut conn = self.conn.clone();
        for attempt in 0..self.retry.max_attempts {
            let acquired: bool = conn
                .set_nx(&full_key, &token)
                .await
                .map_err(LockError::Redis)?;

            if acquired {
                let _: () = conn
                    .pexpire(&full_key, self.ttl.as_millis() as i64)
                    .await
                    .map_err(LockError::Redis)?;

                return Ok(Box::new(RedisLockGuard {
                    conn: self.conn.clone(),
                    key: full_key,
                    token,
                }));
            }

            backoff_sleep(attempt, &self.retry).await;
        }

        if let Some(local) = &self.degraded {
            tracing::warn!(key, "redis lock unreachable, falling back to local lock (degraded mode)");
            return local.lock(key).await;
        }

        Err(LockError::RetriesExhausted {
            attempts: self.retry.max_attempts,
        })
    }
}

fn uuid_like_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_locker_serializes_same_key() {
        let locker = LocalLocker::new();
        let guard = locker.lock("abc").await.unwrap();

        let locker2 = locker.clone();
        let handle = tokio::spawn(async move {
            let _second = locker2.lock("abc").await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn local_locker_allows_distinct_keys_concurrently() {
        let locker = LocalLocker::new();
        let _a = locker.lock("a").await.unwrap();
        let _b = locker.lock("b").await.unwrap();
    }

    #[tokio::test]
    async fn rw_locker_allows_concurrent_readers() {
        let locker = LocalRwLocker::new();
        let _r1 = locker.read().await.unwrap();
        let _r2 = locker.read().await.unwrap();
    }

    #[tokio::test]
    async fn rw_locker_blocks_writer_behind_reader() {
        let locker = LocalRwLocker::new();
        let reader = locker.read().await.unwrap();

        let locker2 = locker.clone();
        let handle = tokio::spawn(async move {
            let _w = locker2.write().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(reader);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn gc_drops_unreferenced_entries() {
        let locker = LocalLocker::new();
        {
            let _guard = locker.lock("transient").await.unwrap();
        }
        locker.gc().await;
        assert!(locker.registry.lock().await.is_empty());
    }
}
