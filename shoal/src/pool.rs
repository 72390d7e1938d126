// Copyright 2021 Joyent, Inc.

pub mod types;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{debug, info, o, warn, Drain, Logger};

use crate::connection::{Connection, PooledConnection};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::pool::types::{PoolOptions, ShardStats};
use crate::shard::{Shard, ShardConfig};

// Default connect deadline in milliseconds
const DEFAULT_CONN_TIMEOUT_MS: u64 = 100;
// Default data operation deadline in milliseconds
const DEFAULT_DATA_TIMEOUT_MS: u64 = 100;
// Default cap on a shard's idle stack
const DEFAULT_MAX_IDLE: usize = 10;
// Default cap on a shard's in-flight connections
const DEFAULT_MAX_ACTIVE: u32 = 100;
// Default consecutive-failure threshold at which a shard becomes suspect
const DEFAULT_MAX_FAILS: u32 = 5;

// Number of shards a single acquire may try before giving up
const MAX_ACQUIRE_TRIES: u32 = 5;
// Period of the health check loop
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
// Connect attempts per health probe
const PROBE_ATTEMPTS: u32 = 2;
// Connect and data deadline used by health probes
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// A pool of connections sharded across a fleet of homogeneous backend
/// servers.
///
/// The pool owns one [`Shard`](../shard/struct.Shard.html) per server
/// endpoint and dispenses connections round-robin across the shards that are
/// in rotation. A background health prober tests suspect or unavailable
/// servers once a second and moves shards out of and back into rotation,
/// refusing to take more than one third of the fleet out at once.
pub struct Pool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static,
{
    inner: Arc<PoolInner<C, F>>,
    health_thread: Mutex<Option<thread::JoinHandle<()>>>,
    health_tx: Mutex<Option<Sender<()>>>,
}

struct PoolInner<C, F>
where
    C: Connection,
    F: Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static,
{
    // Fixed at construction, indexed by the owner back-pointer carried on
    // every dispensed connection.
    shards: Vec<Shard<C>>,
    // Monotonically increasing; taken modulo the shard count on use. Bumped
    // an extra time on every skip so concurrent callers spread away from
    // sick shards.
    cursor: AtomicUsize,
    // Count of shards in rotation. Mutated only by the health prober.
    num_available: AtomicUsize,
    closed: AtomicBool,
    create_connection: F,
    log: Logger,
}

impl<C, F> PoolInner<C, F>
where
    C: Connection,
    F: Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static,
{
    fn acquire(&self) -> Result<PooledConnection<C>, Error> {
        let local = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut last_tried = None;

        for tries in 0..MAX_ACQUIRE_TRIES {
            let index = local.wrapping_add(tries as usize) % self.shards.len();
            let shard = &self.shards[index];

            if !shard.is_available() {
                self.cursor.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            last_tried = Some(shard.server().clone());
            match shard.acquire(&self.create_connection) {
                Some(conn) => return Ok(conn),
                None => {
                    self.cursor.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Err(Error::AcquireExhausted {
            tries: MAX_ACQUIRE_TRIES,
            last_tried,
        })
    }

    // Apply a probe verdict to a shard's availability, keeping
    // num_available in step. A mark-down is refused unless strictly more
    // than two thirds of the shards are available before the transition, so
    // a correlated outage cannot quarantine the whole fleet.
    fn mark_available(&self, shard: &Shard<C>, avail: bool) {
        if avail {
            if shard.mark_available(true) {
                self.num_available.fetch_add(1, Ordering::Relaxed);
                info!(self.log, "server recovered: {}", shard.server());
            }
        } else {
            let num_available = self.num_available.load(Ordering::Relaxed);
            if num_available * 3 > self.shards.len() * 2 {
                if shard.mark_available(false) {
                    self.num_available.fetch_sub(1, Ordering::Relaxed);
                    warn!(self.log, "marked server unavailable: {}", shard.server());
                }
            } else {
                warn!(
                    self.log,
                    "server {} cannot be marked unavailable, too many failed \
                     shards, available: {}, total: {}",
                    shard.server(),
                    num_available,
                    self.shards.len()
                );
            }
        }
    }

    // Check whether the server answers a fresh connect. The probe
    // connection is opened outside the pool and never touches shard
    // counters.
    fn probe(&self, server: &Endpoint) -> bool {
        for _ in 0..PROBE_ATTEMPTS {
            let mut conn = (self.create_connection)(server, PROBE_TIMEOUT, PROBE_TIMEOUT);
            match conn.open() {
                Ok(()) => {
                    let _ = conn.close();
                    return true;
                }
                Err(e) => {
                    debug!(self.log, "probe of {} failed: {}", server, e);
                }
            }
        }
        false
    }

    fn health_check(&self, stop_rx: Receiver<()>) {
        loop {
            match stop_rx.recv_timeout(HEALTH_CHECK_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => (),
            }

            if self.closed.load(Ordering::Relaxed) {
                break;
            }

            for shard in &self.shards {
                if !shard.is_suspectable() && shard.is_available() {
                    continue;
                }
                let ok = self.probe(shard.server());
                self.mark_available(shard, ok);
            }
        }
        debug!(self.log, "health check thread exiting");
    }
}

impl<C, F> Pool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static,
{
    /// Create a pool spanning the given servers and start the health
    /// prober. The `create_connection` function is invoked with an endpoint
    /// and the connect and data deadlines whenever the pool needs a fresh,
    /// unopened connection.
    ///
    /// # Panics
    ///
    /// Panics if `servers` is empty.
    pub fn new(servers: Vec<Endpoint>, options: PoolOptions, create_connection: F) -> Self {
        assert!(!servers.is_empty(), "server list must not be empty");

        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let config = ShardConfig {
            conn_timeout: Duration::from_millis(
                options.conn_timeout_ms.unwrap_or(DEFAULT_CONN_TIMEOUT_MS),
            ),
            data_timeout: Duration::from_millis(
                options.data_timeout_ms.unwrap_or(DEFAULT_DATA_TIMEOUT_MS),
            ),
            max_idle: options.max_idle.unwrap_or(DEFAULT_MAX_IDLE),
            max_active: options.max_active.unwrap_or(DEFAULT_MAX_ACTIVE),
            max_fails: options.max_fails.unwrap_or(DEFAULT_MAX_FAILS),
            wait: options.wait,
            max_wait: options.max_wait_ms.map(Duration::from_millis),
        };

        let num_servers = servers.len();
        let shards = servers
            .into_iter()
            .enumerate()
            .map(|(index, server)| Shard::new(server, index, config.clone(), log.clone()))
            .collect();

        let inner = Arc::new(PoolInner {
            shards,
            cursor: AtomicUsize::new(0),
            num_available: AtomicUsize::new(num_servers),
            closed: AtomicBool::new(false),
            create_connection,
            log,
        });

        let (health_tx, health_rx) = channel();
        let health_inner = Arc::clone(&inner);
        let health_thread = thread::spawn(move || health_inner.health_check(health_rx));

        Pool {
            inner,
            health_thread: Mutex::new(Some(health_thread)),
            health_tx: Mutex::new(Some(health_tx)),
        }
    }

    /// Get a connection from the next available shard in round-robin
    /// order. Shards that are out of rotation or fail to produce a
    /// connection are skipped; after five attempts the acquire fails with
    /// [`Error::AcquireExhausted`](../error/enum.Error.html).
    pub fn acquire(&self) -> Result<PooledConnection<C>, Error> {
        self.inner.acquire()
    }

    /// Return a connection to the shard that owns it. Pass `broken` as true
    /// if the connection misbehaved while borrowed; broken connections are
    /// destroyed and counted against the shard's failure streak instead of
    /// being parked for reuse.
    pub fn release(&self, conn: PooledConnection<C>, broken: bool) -> Result<(), Error> {
        let owner = conn.owner();
        match self.inner.shards.get(owner) {
            Some(shard) => {
                shard.release(conn, broken);
                Ok(())
            }
            None => Err(Error::ContractViolation(format!(
                "released connection owner {} is not a shard of this pool",
                owner
            ))),
        }
    }

    /// Stop the health prober and close every shard. Idle connections are
    /// destroyed, blocked acquires wake and fail, and no further acquire
    /// succeeds. Calling `shutdown` more than once is a no-op.
    pub fn shutdown(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(self.inner.log, "pool already closed");
            return;
        }

        if let Some(health_tx) = self.health_tx.lock().unwrap().take() {
            let _ = health_tx.send(());
        }
        if let Some(handle) = self.health_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        for shard in &self.inner.shards {
            shard.close();
        }
        info!(self.inner.log, "pool shut down");
    }

    /// Snapshot the gauges and counters of every shard in construction
    /// order, zeroing the counters in place.
    pub fn snapshot_stats(&self) -> Vec<ShardStats> {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.read_and_reset_stats())
            .collect()
    }
}

impl<C, F> Drop for Pool<C, F>
where
    C: Connection,
    F: Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
