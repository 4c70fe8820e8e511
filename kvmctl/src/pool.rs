use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::hypervisor::{Connector, Session};
use crate::metrics::MetricsRegistry;

/// First retry delay when a new session cannot be opened.
const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Exponential backoff: `base * 2^attempt`, capped at `MAX_BACKOFF`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    base.saturating_mul(multiplier).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Broken,
}

/// One hypervisor session owned by the pool.
pub struct Connection {
    id: u64,
    state: ConnectionState,
    last_validated: Instant,
    session: Box<dyn Session>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

/// Bounded pool of validated sessions to one hypervisor endpoint.
///
/// At most `max_connections` sessions are checked out at once; a semaphore
/// permit travels with every checked-out session. Sessions are opened lazily,
/// pinged before each checkout and discarded when found broken.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    uri: String,
    max_connections: usize,
    acquire_timeout: Duration,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    /// Checkouts in progress or held. Shutdown waits for this to reach zero.
    in_use: watch::Sender<usize>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: Option<MetricsRegistry>,
}

impl ConnectionPool {
    pub fn new(
        uri: &str,
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        let (in_use, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                uri: uri.to_string(),
                max_connections,
                acquire_timeout: config.acquire_timeout(),
                connector,
                permits: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(VecDeque::with_capacity(max_connections)),
                in_use,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            in_use: *self.inner.in_use.borrow(),
            max: self.inner.max_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Acquire with the configured timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.acquire_timeout).await
    }

    /// Check out a validated session, waiting at most `timeout` in total.
    ///
    /// Fails with `PoolExhausted` when no slot frees up in time,
    /// `ConnectionBroken` when a slot was free but no session could be opened
    /// before the deadline, and `PoolClosed` after [`shutdown`](Self::shutdown).
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(Error::PoolClosed(inner.uri.clone()));
        }

        let started = Instant::now();
        let deadline = started + timeout;

        let permit = match timeout_at(deadline, Arc::clone(&inner.permits).acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed(inner.uri.clone())),
            Err(_) => {
                warn!(uri = %inner.uri, timeout_ms = timeout.as_millis() as u64, "connection pool exhausted");
                return Err(Error::PoolExhausted {
                    uri: inner.uri.clone(),
                    timeout,
                });
            }
        };

        let ticket = InUseTicket::new(Arc::clone(inner));
        if self.is_closed() {
            return Err(Error::PoolClosed(inner.uri.clone()));
        }

        let conn = self.checkout(deadline, timeout).await?;
        let waited = started.elapsed();
        if let Some(m) = &inner.metrics {
            m.record_pool_acquire(waited);
        }
        debug!(
            uri = %inner.uri,
            conn_id = conn.id,
            waited_ms = waited.as_millis() as u64,
            "connection acquired"
        );

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _ticket: ticket,
            _permit: permit,
        })
    }

    /// Reuse the most recently released idle session that still answers a
    /// ping, otherwise open a new one.
    async fn checkout(&self, deadline: Instant, timeout: Duration) -> Result<Connection> {
        let inner = &self.inner;
        loop {
            let candidate = inner.idle.lock().pop_back();
            let Some(mut conn) = candidate else {
                break;
            };
            match timeout_at(deadline, conn.session.ping()).await {
                Ok(Ok(())) => {
                    conn.state = ConnectionState::InUse;
                    conn.last_validated = Instant::now();
                    debug!(uri = %inner.uri, conn_id = conn.id, "reusing idle connection");
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    conn.state = ConnectionState::Broken;
                    warn!(
                        uri = %inner.uri,
                        conn_id = conn.id,
                        idle_for_ms = conn.last_validated.elapsed().as_millis() as u64,
                        error = %e,
                        "idle connection failed validation, discarding"
                    );
                    conn.session.close().await;
                }
                Err(_) => {
                    warn!(uri = %inner.uri, conn_id = conn.id, "validation ran past acquire deadline");
                    conn.session.close().await;
                    return Err(Error::PoolExhausted {
                        uri: inner.uri.clone(),
                        timeout,
                    });
                }
            }
        }
        self.open(deadline).await
    }

    /// Open and validate a new session, retrying with exponential backoff
    /// until `deadline`.
    async fn open(&self, deadline: Instant) -> Result<Connection> {
        let inner = &self.inner;
        let mut attempt = 0u32;
        loop {
            let outcome = timeout_at(deadline, async {
                let mut session = inner.connector.connect(&inner.uri).await?;
                session.ping().await?;
                Ok::<_, Error>(session)
            })
            .await;

            let reason = match outcome {
                Ok(Ok(session)) => {
                    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(uri = %inner.uri, conn_id = id, attempt, "opened hypervisor connection");
                    return Ok(Connection {
                        id,
                        state: ConnectionState::InUse,
                        last_validated: Instant::now(),
                        session,
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out opening connection".to_string(),
            };

            let delay = backoff_delay(CONNECT_BACKOFF_BASE, attempt);
            attempt += 1;
            if Instant::now() + delay >= deadline {
                warn!(uri = %inner.uri, attempts = attempt, error = %reason, "giving up on hypervisor connection");
                return Err(Error::ConnectionBroken {
                    uri: inner.uri.clone(),
                    reason,
                });
            }
            debug!(
                uri = %inner.uri,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "connect attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Refuse new acquires, wait for every checked-out session to come back,
    /// then close all sessions.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();

        let outstanding = *inner.in_use.borrow();
        if outstanding > 0 {
            info!(uri = %inner.uri, outstanding, "waiting for in-use connections");
        }
        let mut rx = inner.in_use.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;

        let drained: Vec<Connection> = inner.idle.lock().drain(..).collect();
        let closed = drained.len();
        for mut conn in drained {
            conn.session.close().await;
        }
        info!(uri = %inner.uri, closed, "connection pool closed");
    }
}

impl PoolInner {
    fn give_back(&self, mut conn: Connection) {
        if conn.state == ConnectionState::Broken {
            warn!(uri = %self.uri, conn_id = conn.id, "discarding broken connection");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { conn.session.close().await });
            }
            return;
        }
        conn.state = ConnectionState::Idle;
        debug!(uri = %self.uri, conn_id = conn.id, "connection released");
        self.idle.lock().push_back(conn);
    }
}

/// Counts one checkout for shutdown's drain. Created as soon as a permit is
/// held so checkouts still validating are waited for too.
struct InUseTicket(Arc<PoolInner>);

impl InUseTicket {
    fn new(pool: Arc<PoolInner>) -> Self {
        pool.in_use.send_modify(|n| *n += 1);
        Self(pool)
    }
}

impl Drop for InUseTicket {
    fn drop(&mut self) {
        self.0.in_use.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A checked-out session. Dropping it releases the session back to the pool,
/// or discards it if [`mark_broken`](Self::mark_broken) was called.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Drop order: ticket before permit.
    _ticket: InUseTicket,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }

    pub fn id(&self) -> u64 {
        self.conn().id
    }

    /// The session failed in a way that makes it unusable. It will be closed
    /// instead of returned to the pool.
    pub fn mark_broken(&mut self) {
        self.conn_mut().state = ConnectionState::Broken;
    }

    /// Explicit form of dropping the guard.
    pub fn release(self) {}
}

impl Deref for PooledConnection {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.conn().session.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn_mut().session.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    fn pool(fake: &FakeHypervisor, max: usize) -> ConnectionPool {
        let config = PoolConfig {
            max_connections: max,
            acquire_timeout_secs: 5,
        };
        ConnectionPool::new("test:///default", &config, Arc::new(fake.clone()), None)
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 5), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 2);
        assert_eq!(fake.connects(), 0);

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1, max: 2 });
        conn.release();
        assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0, max: 2 });

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(fake.connects(), 1);
        // Validated on every checkout.
        assert_eq!(fake.calls("ping"), 2);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_in_use() {
        let fake = FakeHypervisor::new();
        fake.set_delay(Duration::from_millis(5));
        let pool = pool(&fake, 3);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                assert!(pool.stats().in_use <= 3);
                conn.list_domains().await.unwrap();
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        assert!(fake.peak_concurrency() <= 3);
        assert!(fake.connects() <= 3);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert!(stats.idle <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_with_pool_exhausted() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 1);
        let _held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool
            .acquire_timeout(Duration::from_millis(250))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_proceeds_after_release() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        let released_id = a.id();
        drop(a);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, released_id);
        drop(b);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 1);

        let mut conn = pool.acquire().await.unwrap();
        let broken_id = conn.id();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);

        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), broken_id);
        assert_eq!(fake.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_validation_discards_idle_connection() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 2);
        let first = pool.acquire().await.unwrap().id();
        assert_eq!(pool.stats().idle, 1);

        fake.fail_next_pings(1);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(fake.connects(), 2);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let fake = FakeHypervisor::new();
        fake.fail_next_connects(3);
        let pool = pool(&fake, 1);

        let started = Instant::now();
        pool.acquire().await.unwrap();
        assert_eq!(fake.connects(), 4);
        // 100 + 200 + 400 ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_at_deadline() {
        let fake = FakeHypervisor::new();
        fake.fail_next_connects(usize::MAX);
        let pool = pool(&fake, 1);

        let started = Instant::now();
        let err = pool
            .acquire_timeout(Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        match err {
            Error::ConnectionBroken { reason, .. } => assert!(reason.contains("cannot reach")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() <= Duration::from_secs(1));
        // The slot is free again.
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_use_then_closes() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 2);
        let idle = pool.acquire().await.unwrap();
        let held = pool.acquire().await.unwrap();
        drop(idle);

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Error::PoolClosed(_)));

        drop(held);
        shutdown.await.unwrap();
        assert_eq!(fake.closed_sessions(), 2);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let fake = FakeHypervisor::new();
        let pool = pool(&fake, 1);
        drop(pool.acquire().await.unwrap());
        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(fake.closed_sessions(), 1);
    }
}
