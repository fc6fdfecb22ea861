//! Connection Pool (C11, §4.11): a bounded LRU of live `Channel`s, reused up
//! to `MAX_REUSE` executions each, with per-backend single-flight dialing so
//! concurrent `acquire` calls for the same backend never race two handshakes.
//!
//! The teacher has no bounded-pool precedent (its `BackendManager` keeps one
//! long-lived connection per backend forever via a `DashMap`), so the LRU
//! eviction and reuse-counting logic here is new; the per-backend
//! `DashMap`-of-locks idiom for single-flight is carried over from it.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::health::HealthMonitor;
use crate::profile::LaunchSpec;
use crate::transport::{self, Channel};

struct PoolEntry {
    channel: Box<dyn Channel>,
    execution_count: u32,
    last_used_at: Instant,
    /// Held for the entry's whole life, idle or checked out, so the total
    /// number of live connections — not just the idle LRU's size — is what
    /// `MAX_OPEN` bounds (P5).
    _permit: OwnedSemaphorePermit,
}

/// A checked-out connection. The caller must call `pool.release(conn)` (or
/// `pool.discard(conn)` on a failed call) when done — `Channel::close` is
/// async, so this can't happen implicitly on `Drop`.
pub struct PooledConnection {
    backend: String,
    entry: PoolEntry,
}

impl PooledConnection {
    pub fn channel_mut(&mut self) -> &mut (dyn Channel + 'static) {
        self.entry.channel.as_mut()
    }
}

pub struct Pool {
    entries: Mutex<LruCache<String, PoolEntry>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Total permits == `MAX_OPEN`; one is held by every live connection,
    /// idle or checked out, for its entire lifetime.
    capacity: Arc<Semaphore>,
    max_reuse: u32,
}

impl Pool {
    pub fn new(max_open: usize, max_reuse: u32) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(max_open.max(1)).unwrap())),
            locks: DashMap::new(),
            capacity: Arc::new(Semaphore::new(max_open.max(1))),
            max_reuse,
        }
    }

    /// Acquire a connection for `backend`, reusing a pooled one under
    /// `MAX_REUSE` or opening a fresh one via the Transport Factory.
    pub async fn acquire(
        &self,
        backend: &str,
        spec: &LaunchSpec,
        health: &HealthMonitor,
    ) -> Result<PooledConnection, TransportError> {
        if health.is_quarantined(backend).await {
            return Err(TransportError::ConnectFailed(format!(
                "backend '{backend}' is quarantined"
            )));
        }

        if let Some(entry) = self.take_reusable(backend).await {
            debug!(backend, count = entry.execution_count, "reusing pooled connection");
            return Ok(PooledConnection { backend: backend.to_string(), entry });
        }

        let lock = self
            .locks
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have opened one while we waited for the lock.
        if let Some(entry) = self.take_reusable(backend).await {
            return Ok(PooledConnection { backend: backend.to_string(), entry });
        }

        self.make_room_for_new_entry().await;
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .expect("pool capacity semaphore is never closed");

        let channel = transport::open(backend, spec).await?;
        info!(backend, "opened new pooled connection");
        Ok(PooledConnection {
            backend: backend.to_string(),
            entry: PoolEntry {
                channel,
                execution_count: 0,
                last_used_at: Instant::now(),
                _permit: permit,
            },
        })
    }

    async fn take_reusable(&self, backend: &str) -> Option<PoolEntry> {
        let mut entries = self.entries.lock().await;
        match entries.pop(backend) {
            Some(entry) if entry.execution_count < self.max_reuse => Some(entry),
            Some(mut stale) => {
                // Reused past its limit; close it out-of-band and fall through
                // to opening a fresh connection.
                tokio::spawn(async move {
                    let _ = stale.channel.close().await;
                });
                None
            }
            None => None,
        }
    }

    /// If every permit is in use, evict the least-recently-used *idle* entry
    /// to free one before `acquire` waits on the semaphore. If every live
    /// connection is currently checked out (none idle to evict), there is
    /// nothing to do here — `acquire_owned` below blocks until a caller
    /// releases or discards one, which is the correct bound, not a bug.
    async fn make_room_for_new_entry(&self) {
        if self.capacity.available_permits() > 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        if let Some((_, mut evicted)) = entries.pop_lru() {
            tokio::spawn(async move {
                let _ = evicted.channel.close().await;
            });
        }
    }

    /// Return a connection to the pool after a successful call: bump its
    /// execution count, and close it outright if it just hit `MAX_REUSE`.
    pub async fn release(&self, mut conn: PooledConnection) {
        conn.entry.execution_count += 1;
        conn.entry.last_used_at = Instant::now();
        if conn.entry.execution_count >= self.max_reuse {
            let _ = conn.entry.channel.close().await;
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.put(conn.backend, conn.entry);
    }

    /// Drop a connection without returning it to the pool (e.g. after a
    /// transport-level failure, so a broken channel is never reused).
    pub async fn discard(&self, mut conn: PooledConnection) {
        let _ = conn.entry.channel.close().await;
    }

    /// Close every connection idle longer than `idle` (§4.11 `evictIdle`).
    pub async fn evict_idle(&self, idle: Duration) {
        let mut entries = self.entries.lock().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.last_used_at.elapsed() >= idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(mut entry) = entries.pop(&key) {
                tokio::spawn(async move {
                    let _ = entry.channel.close().await;
                });
            }
        }
    }

    /// Close every pooled connection (§4.11 `drain`, §4.12 `shutdown`).
    pub async fn drain(&self) {
        let mut entries = self.entries.lock().await;
        while let Some((_, mut entry)) = entries.pop_lru() {
            let _ = entry.channel.close().await;
        }
    }

    /// Drop any pooled connection for `backend` without reuse (§4.12 `removeBackend`).
    pub async fn evict_backend(&self, backend: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.pop(backend) {
            let _ = entry.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Transport;
    use crate::tool::ServerInfo;
    use crate::transport::ToolOutcome;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChannel {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn initialize(&mut self) -> Result<ServerInfo, TransportError> {
            Ok(ServerInfo { name: "fake".into(), version: "1".into() })
        }
        async fn list_tools(&mut self) -> Result<Vec<crate::tool::ToolDescriptor>, TransportError> {
            Ok(vec![])
        }
        async fn call_tool(&mut self, _name: &str, _args: Value) -> Result<ToolOutcome, TransportError> {
            Ok(ToolOutcome::Success(Value::Null))
        }
        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            transport: Transport::Stdio,
            category: "general".into(),
            command: Some("unused".into()),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            auth: None,
        }
    }

    fn pooled_entry(pool: &Pool, backend: &str, closed: Arc<AtomicUsize>) -> PooledConnection {
        let permit = Arc::clone(&pool.capacity).try_acquire_owned().unwrap();
        PooledConnection {
            backend: backend.to_string(),
            entry: PoolEntry {
                channel: Box::new(FakeChannel { closed }),
                execution_count: 0,
                last_used_at: Instant::now(),
                _permit: permit,
            },
        }
    }

    #[tokio::test]
    async fn release_below_max_reuse_keeps_entry_pooled() {
        let pool = Pool::new(50, 3);
        let closed = Arc::new(AtomicUsize::new(0));
        let conn = pooled_entry(&pool, "fs", closed.clone());
        pool.release(conn).await;
        let reused = pool.take_reusable("fs").await;
        assert!(reused.is_some());
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_at_max_reuse_closes_entry() {
        let pool = Pool::new(50, 1);
        let closed = Arc::new(AtomicUsize::new(0));
        let conn = pooled_entry(&pool, "fs", closed.clone());
        pool.release(conn).await;
        // give the spawned close task a moment
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.take_reusable("fs").await.is_none());
    }

    #[tokio::test]
    async fn quarantined_backend_is_refused() {
        let pool = Pool::new(50, 1000);
        let health = HealthMonitor::new(1, Duration::from_secs(600));
        health.record_failure("fs", crate::error::FailureKind::Permanent).await;
        let result = pool.acquire("fs", &spec(), &health).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_acquire_across_backends_never_exceeds_max_open() {
        let pool = Arc::new(Pool::new(2, 1000));
        let health = Arc::new(HealthMonitor::new(3, Duration::from_secs(600)));

        // Three distinct backends racing `acquire` against a pool bounded at
        // two open connections: the third must wait, never open a third.
        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let pool = Arc::clone(&pool);
            let health = Arc::clone(&health);
            handles.push(tokio::spawn(async move { pool.acquire(name, &spec(), &health).await }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.capacity.available_permits(), 0);

        let mut acquired = Vec::new();
        for handle in handles {
            if let Ok(Ok(conn)) = handle.await {
                acquired.push(conn);
            }
        }
        // Only two of the three could have opened a connection so far; the
        // third task is still parked waiting on the semaphore.
        assert_eq!(acquired.len(), 2);

        for conn in acquired {
            pool.discard(conn).await;
        }
    }

    #[tokio::test]
    async fn drain_closes_every_connection() {
        let pool = Pool::new(50, 1000);
        let closed = Arc::new(AtomicUsize::new(0));
        let conn = pooled_entry(&pool, "fs", closed.clone());
        pool.release(conn).await;
        pool.drain().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
