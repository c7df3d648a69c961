//! Pool (C3): acquire/release with idle reaping, waiter FIFO, and capacity
//! backpressure over a bounded set of [`Connection`]s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::{dial, Connection};
use crate::error::{DriverError, Result};
use crate::options::{PoolOptions, TlsOptions};

/// A point-in-time snapshot of pool counters and set sizes (§4.3's `Stats()`).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: u32,
    /// Connections sitting idle, ready to be acquired.
    pub idle: u32,
    /// `active + idle`.
    pub total: u32,
    /// Acquisitions satisfied by an idle connection.
    pub hits: u64,
    /// Acquisitions satisfied by opening a new connection.
    pub misses: u64,
    /// Acquisitions that exceeded their deadline while queued.
    pub timeouts: u64,
    /// Acquisitions that had to queue at all.
    pub waits: u64,
    /// Connections discarded due to a fatal error.
    pub errors: u64,
    /// Cumulative nanoseconds spent queued across all waiters.
    pub wait_duration_ns: u64,
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    waits: AtomicU64,
    errors: AtomicU64,
    wait_duration_ns: AtomicU64,
    active: AtomicU32,
    total: AtomicU32,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            wait_duration_ns: AtomicU64::new(0),
            active: AtomicU32::new(0),
            total: AtomicU32::new(0),
        }
    }
}

enum WaiterOutcome {
    Assigned(Arc<Connection>),
}

struct Waiter {
    tx: oneshot::Sender<WaiterOutcome>,
}

struct PoolState {
    idle: VecDeque<Arc<Connection>>,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

struct Inner {
    address: String,
    tls: TlsOptions,
    handshake_url: String,
    options: PoolOptions,
    state: Mutex<PoolState>,
    counters: Counters,
}

/// The bounded connection manager described in §4.3. Active only when
/// `options.max_size > 1`; callers in single-connection mode should use
/// [`Connection`] directly instead of constructing a Pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

/// A checked-out Connection. Returned to the pool automatically on drop
/// (§4.3's `release`), so callers never need to call back into the Pool
/// explicitly.
pub struct PooledConnection {
    conn: Option<Arc<Connection>>,
    pool: Weak<Inner>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(inner)) = (self.conn.take(), self.pool.upgrade()) {
            tokio::spawn(async move {
                release(&inner, conn).await;
            });
        }
    }
}

impl Pool {
    /// Eagerly opens `options.min_size` connections, each handshaken with
    /// `handshake_url`. A failure to open the very first connection fails
    /// the whole call (§4.3 Startup).
    pub async fn new(
        address: &str,
        handshake_url: &str,
        tls: TlsOptions,
        options: PoolOptions,
        dial_deadline: Duration,
    ) -> Result<Pool> {
        let inner = Arc::new(Inner {
            address: address.to_string(),
            tls,
            handshake_url: handshake_url.to_string(),
            options: options.clone(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
            counters: Counters::new(),
        });

        for i in 0..options.min_size {
            let conn = dial(&inner.address, &inner.tls, &inner.handshake_url, dial_deadline).await;
            match conn {
                Ok(conn) => {
                    inner.counters.total.fetch_add(1, Ordering::SeqCst);
                    inner.state.lock().await.idle.push_back(Arc::new(conn));
                }
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    warn!(error = %e, "failed to warm pool connection {i}, continuing with fewer idle connections");
                    break;
                }
            }
        }

        Ok(Pool { inner })
    }

    /// Implements §4.3's `acquire` protocol: reuse an idle connection, open
    /// a new one under capacity, or queue FIFO behind other waiters.
    pub async fn acquire(&self, deadline: Duration) -> Result<PooledConnection> {
        let queued_rx = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(DriverError::PoolClosed);
            }

            while let Some(conn) = state.idle.pop_front() {
                if conn.is_alive() {
                    self.inner.counters.hits.fetch_add(1, Ordering::SeqCst);
                    self.inner.counters.active.fetch_add(1, Ordering::SeqCst);
                    return Ok(self.wrap(conn));
                }
                // Dead connection surfaced from idle: discard and keep looking.
                self.inner.counters.total.fetch_sub(1, Ordering::SeqCst);
                self.inner.counters.errors.fetch_add(1, Ordering::SeqCst);
            }

            // Reserve a slot under the lock so concurrent callers can't both
            // observe spare capacity and both proceed to dial (invariant I5).
            if self.inner.counters.total.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.inner.options.max_size).then_some(total + 1)
            }).is_ok() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { tx });
                self.inner.counters.waits.fetch_add(1, Ordering::SeqCst);
                Some(rx)
            }
        };

        if let Some(rx) = queued_rx {
            let wait_start = Instant::now();
            let outcome = timeout(deadline, rx).await;
            self.inner
                .counters
                .wait_duration_ns
                .fetch_add(wait_start.elapsed().as_nanos() as u64, Ordering::SeqCst);
            return match outcome {
                Ok(Ok(WaiterOutcome::Assigned(conn))) => {
                    self.inner.counters.active.fetch_add(1, Ordering::SeqCst);
                    Ok(self.wrap(conn))
                }
                Ok(Err(_)) => Err(DriverError::PoolClosed),
                Err(_) => {
                    self.inner.counters.timeouts.fetch_add(1, Ordering::SeqCst);
                    Err(DriverError::Timeout)
                }
            };
        }

        // Capacity was reserved under the lock above; dial outside it.
        match dial(&self.inner.address, &self.inner.tls, &self.inner.handshake_url, deadline).await {
            Ok(conn) => {
                self.inner.counters.misses.fetch_add(1, Ordering::SeqCst);
                self.inner.counters.active.fetch_add(1, Ordering::SeqCst);
                Ok(self.wrap(Arc::new(conn)))
            }
            Err(e) => {
                // Dial failed: give back the slot reserved before the await.
                self.inner.counters.total.fetch_sub(1, Ordering::SeqCst);
                self.inner.counters.errors.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn wrap(&self, conn: Arc<Connection>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Pings one idle connection if one is available, without blocking on
    /// waiters or opening a new connection. Returns `None` when no idle
    /// connection exists, matching §4.6's "probe one idle Connection if
    /// available, else skip".
    pub async fn probe_idle(&self, deadline: Duration) -> Option<Result<()>> {
        let conn = {
            let mut state = self.inner.state.lock().await;
            state.idle.pop_front()
        }?;
        let result = conn.ping(deadline).await;
        let mut state = self.inner.state.lock().await;
        if conn.is_alive() && !state.closed {
            state.idle.push_back(conn);
        } else if !conn.is_alive() {
            self.inner.counters.total.fetch_sub(1, Ordering::SeqCst);
        }
        Some(result)
    }

    /// A snapshot of all counters and set sizes (§4.3 Observability).
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.inner.counters.active.load(Ordering::SeqCst),
            idle: self.inner.counters.total.load(Ordering::SeqCst)
                - self.inner.counters.active.load(Ordering::SeqCst),
            total: self.inner.counters.total.load(Ordering::SeqCst),
            hits: self.inner.counters.hits.load(Ordering::SeqCst),
            misses: self.inner.counters.misses.load(Ordering::SeqCst),
            timeouts: self.inner.counters.timeouts.load(Ordering::SeqCst),
            waits: self.inner.counters.waits.load(Ordering::SeqCst),
            errors: self.inner.counters.errors.load(Ordering::SeqCst),
            wait_duration_ns: self.inner.counters.wait_duration_ns.load(Ordering::SeqCst),
        }
    }

    /// Spawns the background idle reaper (§4.3 Idle reaping). Returns a
    /// handle the Facade can abort on disconnect.
    pub fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = inner.options.idle_timeout / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                reap_idle(&inner).await;
            }
        })
    }

    /// Refuses new acquires, waits briefly for outstanding checkouts, closes
    /// every remaining connection, and cancels queued waiters with
    /// `POOL_CLOSED` (§4.3 Shutdown).
    pub async fn close(&self, grace_period: Duration) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let idle: Vec<_> = state.idle.drain(..).collect();
        let waiters: Vec<_> = state.waiters.drain(..).collect();
        drop(state);

        for waiter in waiters {
            let _ = waiter.tx; // dropping the sender cancels the waiter with a RecvError
        }
        for conn in idle {
            conn.close().await;
        }

        let deadline = Instant::now() + grace_period;
        while self.inner.counters.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn release(inner: &Inner, conn: Arc<Connection>) {
    inner.counters.active.fetch_sub(1, Ordering::SeqCst);

    if !conn.is_alive() {
        inner.counters.total.fetch_sub(1, Ordering::SeqCst);
        inner.counters.errors.fetch_add(1, Ordering::SeqCst);
        maybe_replace(inner).await;
        return;
    }

    let mut state = inner.state.lock().await;
    if state.closed {
        drop(state);
        conn.close().await;
        inner.counters.total.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    if let Some(waiter) = state.waiters.pop_front() {
        drop(state);
        if let Err(WaiterOutcome::Assigned(conn)) = waiter.tx.send(WaiterOutcome::Assigned(conn)) {
            // Waiter was cancelled racing with this hand-off: it never
            // observes the connection, so return it to idle instead.
            inner.state.lock().await.idle.push_back(conn);
        }
        return;
    }
    state.idle.push_back(conn);
}

async fn maybe_replace(inner: &Inner) {
    if inner.counters.total.load(Ordering::SeqCst) >= inner.options.min_size {
        return;
    }
    match dial(&inner.address, &inner.tls, &inner.handshake_url, Duration::from_secs(10)).await {
        Ok(conn) => {
            inner.counters.total.fetch_add(1, Ordering::SeqCst);
            let mut state = inner.state.lock().await;
            if !state.closed {
                state.idle.push_back(Arc::new(conn));
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to open replacement connection after pool fell below min_size");
        }
    }
}

async fn reap_idle(inner: &Inner) {
    let mut state = inner.state.lock().await;
    let mut keep = VecDeque::with_capacity(state.idle.len());
    while let Some(conn) = state.idle.pop_front() {
        let age = conn.last_activity().await.elapsed();
        let would_drop_below_min =
            inner.counters.total.load(Ordering::SeqCst) <= inner.options.min_size;
        if age > inner.options.idle_timeout && !would_drop_below_min {
            debug!(age_ms = age.as_millis(), "reaping idle connection");
            drop(state);
            conn.close().await;
            inner.counters.total.fetch_sub(1, Ordering::SeqCst);
            state = inner.state.lock().await;
        } else {
            keep.push_back(conn);
        }
    }
    state.idle = keep;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_default_is_all_zero() {
        let stats = PoolStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.hits, 0);
    }
}
