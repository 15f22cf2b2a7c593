//! Bounded connection pool with idle/lifetime eviction.
//!
//! Connections live in an arena of slots. A slot is either vacant (on the
//! free list), idle (holding a connection ready to borrow) or checked out.
//! Borrowers hand the connection back with [`ConnectionPool::put`] and a
//! `poison` flag; poisoned connections are closed instead of reused.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout, Instant};

use crate::error::MqError;
use crate::metrics::PoolMetrics;

/// Error type for pool operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Connection pool is closed")]
    Closed,

    #[error("Connection pool exhausted")]
    Exhausted,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    WaitTimeout(Duration),
}

/// Opens and closes the native connections a pool manages.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn dial(&self) -> Result<Self::Conn, MqError>;

    async fn close(&self, conn: Self::Conn);

    /// Cheap liveness check applied to idle connections before reuse.
    fn is_alive(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

/// Pool sizing and eviction.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Idle connections kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Connections borrowed at once (0 = unbounded)
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Close idle connections unused for this long (0 = never)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Close connections older than this (0 = never)
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// Block when `max_active` is reached instead of failing
    #[serde(default = "default_wait")]
    pub wait: bool,
    /// Upper bound on blocking for a connection
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_max_idle() -> usize {
    2
}

fn default_max_active() -> usize {
    10
}

fn default_idle_timeout_ms() -> u64 {
    60_000 // 1 minute
}

fn default_max_lifetime_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_wait() -> bool {
    true
}

fn default_wait_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            wait: default_wait(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl PoolConfig {
    fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_ms > 0).then(|| Duration::from_millis(self.max_lifetime_ms))
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections open, idle or borrowed
    pub active: usize,
    /// Connections waiting in the idle set
    pub idle: usize,
    /// Connections dialed over the pool's lifetime
    pub dialed: u64,
    /// Connections closed instead of reused
    pub discarded: u64,
}

struct Slot<C> {
    /// `None` while checked out
    conn: Option<C>,
    created_at: Instant,
    last_used: Instant,
}

struct Arena<C> {
    slots: Vec<Option<Slot<C>>>,
    vacant: Vec<usize>,
    idle: Vec<usize>,
    closed: bool,
    dialed: u64,
    discarded: u64,
}

impl<C> Arena<C> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            idle: Vec::new(),
            closed: false,
            dialed: 0,
            discarded: 0,
        }
    }

    fn occupy(&mut self, now: Instant) -> usize {
        let slot = Slot {
            conn: None,
            created_at: now,
            last_used: now,
        };
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn vacate(&mut self, index: usize) {
        if let Some(entry) = self.slots.get_mut(index) {
            if entry.take().is_some() {
                self.vacant.push(index);
                self.discarded += 1;
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.slots.len() - self.vacant.len(),
            idle: self.idle.len(),
            dialed: self.dialed,
            discarded: self.discarded,
        }
    }
}

struct Shared<C> {
    name: String,
    arena: Mutex<Arena<C>>,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Arena<C>> {
        match self.arena.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_stats(&self, arena: &Arena<C>) {
        let stats = arena.stats();
        PoolMetrics::update(&self.name, stats.active, stats.idle);
    }
}

/// A borrowed connection. Return it with [`ConnectionPool::put`]; dropping it
/// instead releases its slot and drops the native handle.
pub struct PooledConnection<C> {
    slot: usize,
    conn: Option<C>,
    shared: Arc<Shared<C>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C> PooledConnection<C> {
    /// Arena slot backing this connection.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("returned", &self.conn.is_none())
            .finish()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection is present until returned"))
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection is present until returned"))
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            let mut arena = self.shared.lock();
            arena.vacate(self.slot);
            self.shared.publish_stats(&arena);
        }
    }
}

/// Bounded pool of native connections.
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    config: PoolConfig,
    shared: Arc<Shared<D::Conn>>,
    permits: Option<Arc<Semaphore>>,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(name: impl Into<String>, dialer: D, config: PoolConfig) -> Self {
        let permits = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));
        Self {
            dialer,
            config,
            shared: Arc::new(Shared {
                name: name.into(),
                arena: Mutex::new(Arena::new()),
            }),
            permits,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Borrow an idle connection, or dial a new one within `max_active`.
    pub async fn get(&self) -> Result<PooledConnection<D::Conn>, MqError> {
        let permit = self.acquire_permit().await?;

        loop {
            let candidate = {
                let mut arena = self.shared.lock();
                if arena.closed {
                    return Err(PoolError::Closed.into());
                }
                match arena.idle.pop() {
                    Some(index) => {
                        let slot = arena.slots[index]
                            .as_mut()
                            .map(|slot| (slot.conn.take(), slot.created_at, slot.last_used));
                        Some((index, slot))
                    }
                    None => None,
                }
            };

            let Some((index, slot)) = candidate else {
                break;
            };
            let Some((Some(conn), created_at, last_used)) = slot else {
                continue;
            };

            if let Some(reason) = self.eviction_reason(&conn, created_at, last_used) {
                self.discard(index, conn, reason).await;
                continue;
            }

            tracing::trace!(pool = %self.shared.name, slot = index, "Reusing idle connection");
            return Ok(PooledConnection {
                slot: index,
                conn: Some(conn),
                shared: Arc::clone(&self.shared),
                permit,
            });
        }

        let conn = self.dialer.dial().await?;

        let index = {
            let mut arena = self.shared.lock();
            if arena.closed {
                None
            } else {
                let index = arena.occupy(Instant::now());
                arena.dialed += 1;
                self.shared.publish_stats(&arena);
                Some(index)
            }
        };

        match index {
            Some(index) => {
                tracing::debug!(pool = %self.shared.name, slot = index, "Dialed new connection");
                Ok(PooledConnection {
                    slot: index,
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                    permit,
                })
            }
            None => {
                self.dialer.close(conn).await;
                Err(PoolError::Closed.into())
            }
        }
    }

    /// Return a borrowed connection. Poisoned connections are closed.
    pub async fn put(&self, mut entry: PooledConnection<D::Conn>, poison: bool) {
        let Some(conn) = entry.conn.take() else {
            return;
        };
        let index = entry.slot;
        // Released only after the connection is back in the idle set
        let _permit = entry.permit.take();
        drop(entry);

        let reason = {
            let mut arena = self.shared.lock();
            let expired = arena.slots[index]
                .as_ref()
                .zip(self.config.max_lifetime())
                .is_some_and(|(slot, lifetime)| slot.created_at.elapsed() >= lifetime);

            let reason = if arena.closed {
                Some("closed")
            } else if poison {
                Some("poisoned")
            } else if expired {
                Some("expired")
            } else if arena.idle.len() >= self.config.max_idle {
                Some("overflow")
            } else {
                None
            };

            match reason {
                Some(_) => arena.vacate(index),
                None => {
                    if let Some(slot) = arena.slots[index].as_mut() {
                        slot.conn = Some(conn);
                        slot.last_used = Instant::now();
                        arena.idle.push(index);
                        self.shared.publish_stats(&arena);
                        return;
                    }
                    // The slot vanished (pool closed and reset); treat as discard
                    arena.vacate(index);
                }
            }
            self.shared.publish_stats(&arena);
            reason.unwrap_or("closed")
        };

        if reason == "poisoned" {
            tracing::warn!(pool = %self.shared.name, slot = index, "Discarding poisoned connection");
        } else {
            tracing::debug!(pool = %self.shared.name, slot = index, reason = reason, "Closing pooled connection");
        }
        PoolMetrics::record_discarded(&self.shared.name, reason);
        self.dialer.close(conn).await;
    }

    /// Close idle connections and reject further borrows.
    pub async fn close(&self) {
        let idle: Vec<D::Conn> = {
            let mut arena = self.shared.lock();
            arena.closed = true;
            let indices: Vec<usize> = arena.idle.drain(..).collect();
            let mut conns = Vec::with_capacity(indices.len());
            for index in indices {
                if let Some(conn) = arena.slots[index].as_mut().and_then(|slot| slot.conn.take()) {
                    conns.push(conn);
                }
                arena.vacate(index);
            }
            self.shared.publish_stats(&arena);
            conns
        };

        if let Some(permits) = &self.permits {
            permits.close();
        }

        tracing::info!(pool = %self.shared.name, closed = idle.len(), "Connection pool closed");
        for conn in idle {
            self.dialer.close(conn).await;
        }
    }

    async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, MqError> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };

        if self.config.wait {
            let limit = Duration::from_millis(self.config.wait_timeout_ms);
            match timeout(limit, Arc::clone(permits).acquire_owned()).await {
                Ok(Ok(permit)) => Ok(Some(permit)),
                Ok(Err(_)) => Err(PoolError::Closed.into()),
                Err(_) => Err(PoolError::WaitTimeout(limit).into()),
            }
        } else {
            match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted.into()),
                Err(TryAcquireError::Closed) => Err(PoolError::Closed.into()),
            }
        }
    }

    fn eviction_reason(
        &self,
        conn: &D::Conn,
        created_at: Instant,
        last_used: Instant,
    ) -> Option<&'static str> {
        if self
            .config
            .max_lifetime()
            .is_some_and(|lifetime| created_at.elapsed() >= lifetime)
        {
            Some("expired")
        } else if self
            .config
            .idle_timeout()
            .is_some_and(|idle| last_used.elapsed() >= idle)
        {
            Some("idle")
        } else if !self.dialer.is_alive(conn) {
            Some("dead")
        } else {
            None
        }
    }

    async fn discard(&self, index: usize, conn: D::Conn, reason: &'static str) {
        {
            let mut arena = self.shared.lock();
            arena.vacate(index);
            self.shared.publish_stats(&arena);
        }
        tracing::debug!(pool = %self.shared.name, slot = index, reason = reason, "Evicting idle connection");
        PoolMetrics::record_discarded(&self.shared.name, reason);
        self.dialer.close(conn).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestConn {
        id: usize,
        alive: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct TestDialer {
        dialed: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Dialer for TestDialer {
        type Conn = TestConn;

        async fn dial(&self) -> Result<TestConn, MqError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MqError::transport("connection refused"));
            }
            Ok(TestConn {
                id: self.dialed.fetch_add(1, Ordering::SeqCst),
                alive: Arc::new(AtomicBool::new(true)),
            })
        }

        async fn close(&self, _conn: TestConn) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_alive(&self, conn: &TestConn) -> bool {
            conn.alive.load(Ordering::SeqCst)
        }
    }

    fn config(max_idle: usize, max_active: usize, wait: bool) -> PoolConfig {
        PoolConfig {
            max_idle,
            max_active,
            idle_timeout_ms: 0,
            max_lifetime_ms: 0,
            wait,
            wait_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_reuses_returned_connection() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(2, 4, false));

        let conn = pool.get().await.unwrap();
        let id = conn.id;
        pool.put(conn, false).await;

        let again = pool.get().await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(pool.stats().dialed, 1);
    }

    #[tokio::test]
    async fn test_poisoned_connection_is_closed() {
        let dialer = TestDialer::default();
        let closed = dialer.closed.clone();
        let pool = ConnectionPool::new("test", dialer, config(2, 4, false));

        let conn = pool.get().await.unwrap();
        let id = conn.id;
        pool.put(conn, true).await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 0);

        let fresh = pool.get().await.unwrap();
        assert_ne!(fresh.id, id);
    }

    #[tokio::test]
    async fn test_max_active_without_wait_fails_fast() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(1, 1, false));

        let held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, MqError::Pool(PoolError::Exhausted)));

        pool.put(held, false).await;
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_pooled_connection_debug_shows_slot() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(1, 1, false));

        let conn = pool.get().await.unwrap();
        let rendered = format!("{:?}", conn);
        assert!(rendered.contains(&format!("slot: {}", conn.slot())));

        pool.put(conn, false).await;
    }

    #[tokio::test]
    async fn test_max_active_with_wait_times_out() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(1, 1, true));

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, MqError::Pool(PoolError::WaitTimeout(_))));
    }

    #[tokio::test]
    async fn test_waiter_gets_returned_connection() {
        let pool = Arc::new(ConnectionPool::new(
            "test",
            TestDialer::default(),
            PoolConfig {
                wait_timeout_ms: 1_000,
                ..config(1, 1, true)
            },
        ));

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|c| c.id) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.put(held, false).await;

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflow_beyond_max_idle_is_closed() {
        let dialer = TestDialer::default();
        let closed = dialer.closed.clone();
        let pool = ConnectionPool::new("test", dialer, config(1, 0, false));

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a, false).await;
        pool.put(b, false).await;

        assert_eq!(pool.stats().idle, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(2, 4, false));

        let conn = pool.get().await.unwrap();
        conn.alive.store(false, Ordering::SeqCst);
        pool.put(conn, false).await;

        let fresh = pool.get().await.unwrap();
        assert_eq!(fresh.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_evicts() {
        let pool = ConnectionPool::new(
            "test",
            TestDialer::default(),
            PoolConfig {
                idle_timeout_ms: 100,
                ..config(2, 4, false)
            },
        );

        let conn = pool.get().await.unwrap();
        pool.put(conn, false).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let fresh = pool.get().await.unwrap();
        assert_eq!(fresh.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lifetime_evicts_on_return() {
        let dialer = TestDialer::default();
        let closed = dialer.closed.clone();
        let pool = ConnectionPool::new(
            "test",
            dialer,
            PoolConfig {
                max_lifetime_ms: 100,
                ..config(2, 4, false)
            },
        );

        let conn = pool.get().await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        pool.put(conn, false).await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_get_and_closes_idle() {
        let dialer = TestDialer::default();
        let closed = dialer.closed.clone();
        let pool = ConnectionPool::new("test", dialer, config(2, 4, true));

        let conn = pool.get().await.unwrap();
        pool.put(conn, false).await;
        pool.close().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get().await.unwrap_err(),
            MqError::Pool(PoolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_put_after_close_closes_connection() {
        let dialer = TestDialer::default();
        let closed = dialer.closed.clone();
        let pool = ConnectionPool::new("test", dialer, config(2, 4, false));

        let conn = pool.get().await.unwrap();
        pool.close().await;
        pool.put(conn, false).await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_capacity() {
        let dialer = TestDialer::default();
        dialer.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new("test", dialer, config(1, 1, false));

        assert!(pool.get().await.is_err());
        assert_eq!(pool.stats().active, 0);

        pool.dialer.fail.store(false, Ordering::SeqCst);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_entry_frees_slot() {
        let pool = ConnectionPool::new("test", TestDialer::default(), config(2, 1, false));

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.stats().active, 1);
        drop(conn);

        assert_eq!(pool.stats().active, 0);
        assert!(pool.get().await.is_ok());
    }
}
