// Copyright 2021 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, warn, Logger};

use crate::connection::{Connection, PooledConnection};
use crate::endpoint::Endpoint;
use crate::pool::types::{ConnectionCount, ShardStats};

// The per-shard slice of the pool configuration, with defaults already
// applied and durations already converted.
#[derive(Clone, Debug)]
pub(crate) struct ShardConfig {
    pub conn_timeout: Duration,
    pub data_timeout: Duration,
    pub max_idle: usize,
    // Zero means no limit on in-flight connections.
    pub max_active: u32,
    pub max_fails: u32,
    pub wait: bool,
    pub max_wait: Option<Duration>,
}

#[derive(Clone, Copy, Debug)]
struct ShardCounters {
    num_get: ConnectionCount,
    num_put: ConnectionCount,
    num_broken: ConnectionCount,
    num_dial: ConnectionCount,
    num_dial_fail: ConnectionCount,
    num_evict: ConnectionCount,
    num_close: ConnectionCount,
}

impl ShardCounters {
    fn new() -> Self {
        ShardCounters {
            num_get: 0.into(),
            num_put: 0.into(),
            num_broken: 0.into(),
            num_dial: 0.into(),
            num_dial_fail: 0.into(),
            num_evict: 0.into(),
            num_close: 0.into(),
        }
    }

    fn reset(&mut self) {
        *self = ShardCounters::new();
    }
}

// The mutable shard state guarded by the shard mutex.
struct ShardCore<C> {
    // Idle connections with the most recently used at the front.
    idle: VecDeque<PooledConnection<C>>,
    // Number of connections the shard owns, idle or borrowed.
    active: u32,
    counters: ShardCounters,
}

/// The per-endpoint sub-pool owning the idle and active connection
/// inventory for one backend server.
///
/// A shard dials connections on demand up to `max_active`, parks clean
/// returns on a LIFO idle stack capped at `max_idle`, and counts
/// consecutive failures so the pool's health prober knows when to test the
/// server out of band. The `available` flag is the prober's verdict; the
/// shard itself only reads it.
pub struct Shard<C> {
    server: Endpoint,
    // This shard's position in the pool's shard vector. Dispensed
    // connections carry it as their owner back-pointer.
    index: usize,
    config: ShardConfig,
    available: AtomicBool,
    closed: AtomicBool,
    // Consecutive failure count, nginx-style: reset to zero by any
    // successful open or clean release.
    fails: AtomicU32,
    core: Mutex<ShardCore<C>>,
    cv: Condvar,
    log: Logger,
}

impl<C> Shard<C>
where
    C: Connection,
{
    pub(crate) fn new(
        server: Endpoint,
        index: usize,
        config: ShardConfig,
        log: Logger,
    ) -> Self {
        let max_idle = config.max_idle;
        Shard {
            server,
            index,
            config,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fails: AtomicU32::new(0),
            core: Mutex::new(ShardCore {
                idle: VecDeque::with_capacity(max_idle),
                active: 0,
                counters: ShardCounters::new(),
            }),
            cv: Condvar::new(),
            log,
        }
    }

    /// The endpoint this shard serves.
    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// Whether the shard is in rotation.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Whether the consecutive failure count has reached the threshold at
    /// which the health prober tests the server even if the shard is still
    /// marked available.
    pub fn is_suspectable(&self) -> bool {
        self.fails.load(Ordering::Relaxed) >= self.config.max_fails
    }

    // Flip the availability flag. Returns true if the underlying atomic
    // value was changed, false otherwise. Only the pool's health prober may
    // call this; the pool's available-shard count is maintained from the
    // return value.
    pub(crate) fn mark_available(&self, avail: bool) -> bool {
        self.available
            .compare_exchange(!avail, avail, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    // Hand out a connection: the most recently parked idle connection if
    // there is one, otherwise a fresh dial if capacity permits. Returns
    // None on a failed dial, on a closed shard, and on fail-fast or timed
    // out exhaustion; the pool moves on to the next shard.
    pub(crate) fn acquire<F>(&self, create_connection: &F) -> Option<PooledConnection<C>>
    where
        F: Fn(&Endpoint, Duration, Duration) -> C,
    {
        let start = Instant::now();
        let mut core = self.core.lock().unwrap();
        core.counters.num_get += 1.into();

        loop {
            if let Some(mut conn) = core.idle.pop_front() {
                conn.set_borrowed(true);
                return Some(conn);
            }

            if self.closed.load(Ordering::Relaxed) {
                drop(core);
                debug!(self.log, "acquire on closed shard {}", self.server);
                return None;
            }

            if self.config.max_active == 0 || core.active < self.config.max_active {
                // Dial outside the lock. The active count is taken
                // optimistically and rolled back if the open fails.
                core.active += 1;
                core.counters.num_dial += 1.into();
                drop(core);

                let mut conn = create_connection(
                    &self.server,
                    self.config.conn_timeout,
                    self.config.data_timeout,
                );
                match conn.open() {
                    Ok(()) => {
                        self.fails.store(0, Ordering::Relaxed);
                        return Some(PooledConnection::new(conn, self.index));
                    }
                    Err(e) => {
                        self.fails.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            self.log,
                            "failed to open connection to {}: {}", self.server, e
                        );
                        let mut core = self.core.lock().unwrap();
                        core.active -= 1;
                        core.counters.num_dial_fail += 1.into();
                        drop(core);
                        self.cv.notify_one();
                        return None;
                    }
                }
            }

            debug!(
                self.log,
                "shard {} at capacity, active: {}", self.server, core.active
            );

            if !self.config.wait {
                return None;
            }

            core = match self.config.max_wait {
                None => self.cv.wait(core).unwrap(),
                Some(max_wait) => {
                    let waited = start.elapsed();
                    if waited >= max_wait {
                        drop(core);
                        warn!(
                            self.log,
                            "timed out waiting for idle connection on shard {}",
                            self.server
                        );
                        return None;
                    }
                    let (guard, wait_result) =
                        self.cv.wait_timeout(core, max_wait - waited).unwrap();
                    if wait_result.timed_out() {
                        drop(guard);
                        warn!(
                            self.log,
                            "timed out waiting for idle connection on shard {}",
                            self.server
                        );
                        return None;
                    }
                    guard
                }
            };
        }
    }

    // Take a connection back. Clean returns are parked at the front of the
    // idle stack, evicting the least recently used entry if the stack is
    // over its cap. Broken returns and returns to a closed shard are
    // destroyed. A release of a connection that is not marked borrowed is a
    // duplicate and is dropped without effect.
    pub(crate) fn release(&self, mut conn: PooledConnection<C>, broken: bool) {
        let mut core = self.core.lock().unwrap();
        core.counters.num_put += 1.into();

        if !conn.is_borrowed() {
            return;
        }
        conn.set_borrowed(false);

        if broken {
            self.fails.fetch_add(1, Ordering::Relaxed);
            core.counters.num_broken += 1.into();
        } else {
            self.fails.store(0, Ordering::Relaxed);
        }

        let mut victim = Some(conn);
        if !self.closed.load(Ordering::Relaxed) && !broken {
            core.idle.push_front(victim.take().unwrap());
            if core.idle.len() > self.config.max_idle {
                victim = core.idle.pop_back();
                core.counters.num_evict += 1.into();
            }
        }

        match victim {
            None => {
                drop(core);
                self.cv.notify_one();
            }
            Some(victim) => {
                core.active -= 1;
                core.counters.num_close += 1.into();
                drop(core);
                self.cv.notify_one();
                self.destroy(victim);
            }
        }
    }

    // Close the shard: further acquires return None and released
    // connections are no longer parked. Idempotent.
    pub(crate) fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(self.log, "shard {} already closed", self.server);
            return;
        }
        self.drain();
    }

    // Destroy the idle stack, waking one waiter per drained connection and
    // the remainder afterwards so every blocked acquire observes the closed
    // flag.
    fn drain(&self) {
        let mut core = self.core.lock().unwrap();
        while let Some(conn) = core.idle.pop_front() {
            core.active -= 1;
            core.counters.num_close += 1.into();
            drop(core);
            self.cv.notify_one();
            self.destroy(conn);
            core = self.core.lock().unwrap();
        }
        drop(core);
        self.cv.notify_all();
    }

    // Connection teardown runs outside the shard lock so a slow transport
    // close cannot stall acquires.
    fn destroy(&self, mut conn: PooledConnection<C>) {
        if let Err(e) = conn.close() {
            warn!(
                self.log,
                "failed to close connection to {}: {}", self.server, e
            );
        }
    }

    // Snapshot the gauges and counters, zeroing the counters in place.
    pub(crate) fn read_and_reset_stats(&self) -> ShardStats {
        let available = self.is_available();
        let mut core = self.core.lock().unwrap();
        let stats = ShardStats {
            server: self.server.clone(),
            available,
            num_active: ConnectionCount::from(core.active),
            num_get: core.counters.num_get,
            num_put: core.counters.num_put,
            num_broken: core.counters.num_broken,
            num_dial: core.counters.num_dial,
            num_dial_fail: core.counters.num_dial_fail,
            num_evict: core.counters.num_evict,
            num_close: core.counters.num_close,
        };
        core.counters.reset();
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use slog::{o, Logger};

    use super::{Shard, ShardConfig};
    use crate::connection::{Connection, PooledConnection};
    use crate::endpoint::Endpoint;

    #[derive(Debug)]
    struct TestConnection {
        id: u32,
        open_ok: Arc<AtomicBool>,
        opened: bool,
    }

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            "connection refused".fmt(fmt)
        }
    }

    impl std::error::Error for TestError {}

    impl Connection for TestConnection {
        type Error = TestError;

        fn open(&mut self) -> Result<(), TestError> {
            if !self.open_ok.load(Ordering::Relaxed) {
                return Err(TestError);
            }
            self.opened = true;
            Ok(())
        }

        fn close(&mut self) -> Result<(), TestError> {
            self.opened = false;
            Ok(())
        }
    }

    fn test_config() -> ShardConfig {
        ShardConfig {
            conn_timeout: Duration::from_millis(100),
            data_timeout: Duration::from_millis(100),
            max_idle: 2,
            max_active: 0,
            max_fails: 2,
            wait: false,
            max_wait: None,
        }
    }

    fn test_shard(config: ShardConfig) -> Shard<TestConnection> {
        Shard::new(
            Endpoint::new("127.0.0.1", 7777),
            0,
            config,
            Logger::root(slog::Discard, o!()),
        )
    }

    fn factory(
        next_id: Arc<AtomicU32>,
        open_ok: Arc<AtomicBool>,
    ) -> impl Fn(&Endpoint, Duration, Duration) -> TestConnection {
        move |_server: &Endpoint, _conn_timeout: Duration, _data_timeout: Duration| {
            TestConnection {
                id: next_id.fetch_add(1, Ordering::Relaxed),
                open_ok: open_ok.clone(),
                opened: false,
            }
        }
    }

    #[test]
    fn acquire_dials_then_reuses_most_recent_idle() {
        let shard = test_shard(test_config());
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let conn_a = shard.acquire(&create).unwrap();
        let conn_b = shard.acquire(&create).unwrap();
        assert_eq!(conn_a.id, 0);
        assert_eq!(conn_b.id, 1);
        assert!(conn_a.is_borrowed());

        shard.release(conn_a, false);
        shard.release(conn_b, false);

        // LIFO: the connection parked last comes back first
        let conn_c = shard.acquire(&create).unwrap();
        assert_eq!(conn_c.id, 1);
        shard.release(conn_c, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_get, 3.into());
        assert_eq!(stats.num_put, 3.into());
        assert_eq!(stats.num_dial, 2.into());
        assert_eq!(stats.num_active, 2.into());
    }

    #[test]
    fn release_evicts_least_recently_used_beyond_max_idle() {
        let mut config = test_config();
        config.max_idle = 1;
        let shard = test_shard(config);
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let conn_a = shard.acquire(&create).unwrap();
        let conn_b = shard.acquire(&create).unwrap();
        shard.release(conn_a, false);
        shard.release(conn_b, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_evict, 1.into());
        assert_eq!(stats.num_close, 1.into());
        assert_eq!(stats.num_active, 1.into());

        // the survivor is the most recently released connection
        let conn_c = shard.acquire(&create).unwrap();
        assert_eq!(conn_c.id, 1);
        shard.release(conn_c, false);
    }

    #[test]
    fn broken_release_destroys_and_next_acquire_redials() {
        let shard = test_shard(test_config());
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let conn_a = shard.acquire(&create).unwrap();
        shard.release(conn_a, true);

        let conn_b = shard.acquire(&create).unwrap();
        assert_eq!(conn_b.id, 1);
        shard.release(conn_b, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_broken, 1.into());
        assert_eq!(stats.num_dial, 2.into());
        assert_eq!(stats.num_close, 1.into());
        assert_eq!(stats.num_active, 1.into());
    }

    #[test]
    fn duplicate_release_is_dropped() {
        let shard = test_shard(test_config());

        let conn = TestConnection {
            id: 99,
            open_ok: Arc::new(AtomicBool::new(true)),
            opened: false,
        };
        let mut pooled = PooledConnection::new(conn, 0);
        pooled.set_borrowed(false);
        shard.release(pooled, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_put, 1.into());
        assert_eq!(stats.num_close, 0.into());
        assert_eq!(stats.num_active, 0.into());
    }

    #[test]
    fn closed_shard_rejects_acquires_and_returns() {
        let shard = test_shard(test_config());
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let conn_a = shard.acquire(&create).unwrap();
        let conn_b = shard.acquire(&create).unwrap();
        shard.release(conn_a, false);

        shard.close();
        // closing again is a no-op
        shard.close();

        assert!(shard.acquire(&create).is_none());

        // a borrowed connection handed back after close is destroyed, not
        // re-parked
        shard.release(conn_b, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_close, 2.into());
        assert_eq!(stats.num_active, 0.into());
    }

    #[test]
    fn consecutive_dial_failures_make_shard_suspect() {
        let shard = test_shard(test_config());
        let open_ok = Arc::new(AtomicBool::new(false));
        let create = factory(Arc::new(AtomicU32::new(0)), open_ok.clone());

        assert!(shard.acquire(&create).is_none());
        assert!(!shard.is_suspectable());
        assert!(shard.acquire(&create).is_none());
        assert!(shard.is_suspectable());

        // a successful open resets the failure streak
        open_ok.store(true, Ordering::Relaxed);
        let conn = shard.acquire(&create).unwrap();
        assert!(!shard.is_suspectable());
        shard.release(conn, false);

        let stats = shard.read_and_reset_stats();
        assert_eq!(stats.num_dial, 3.into());
        assert_eq!(stats.num_dial_fail, 2.into());
        assert_eq!(stats.num_active, 1.into());
    }

    #[test]
    fn acquire_fails_fast_at_capacity() {
        let mut config = test_config();
        config.max_active = 1;
        let shard = test_shard(config);
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let held = shard.acquire(&create).unwrap();
        assert!(shard.acquire(&create).is_none());

        shard.release(held, false);
        let conn = shard.acquire(&create).unwrap();
        assert_eq!(conn.id, 0);
        shard.release(conn, false);
    }

    #[test]
    fn waiting_acquire_times_out_at_deadline() {
        let mut config = test_config();
        config.max_active = 1;
        config.wait = true;
        config.max_wait = Some(Duration::from_millis(50));
        let shard = test_shard(config);
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let _held = shard.acquire(&create).unwrap();

        let start = Instant::now();
        assert!(shard.acquire(&create).is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn waiting_acquire_wakes_on_release() {
        let mut config = test_config();
        config.max_active = 1;
        config.wait = true;
        config.max_wait = Some(Duration::from_millis(5000));
        let shard = Arc::new(test_shard(config));

        let next_id = Arc::new(AtomicU32::new(0));
        let open_ok = Arc::new(AtomicBool::new(true));
        let create = factory(next_id.clone(), open_ok.clone());

        let held = shard.acquire(&create).unwrap();

        let waiter_shard = shard.clone();
        let waiter_create = factory(next_id, open_ok);
        let waiter = thread::spawn(move || {
            let conn = waiter_shard.acquire(&waiter_create).unwrap();
            let id = conn.id;
            waiter_shard.release(conn, false);
            id
        });

        thread::sleep(Duration::from_millis(50));
        shard.release(held, false);

        // the waiter gets the connection that was just parked
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn stats_snapshot_resets_counters() {
        let shard = test_shard(test_config());
        let create = factory(
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicBool::new(true)),
        );

        let conn = shard.acquire(&create).unwrap();
        shard.release(conn, false);

        let first = shard.read_and_reset_stats();
        assert_eq!(first.num_get, 1.into());
        assert_eq!(first.num_dial, 1.into());

        let second = shard.read_and_reset_stats();
        assert_eq!(second.num_get, 0.into());
        assert_eq!(second.num_dial, 0.into());
        // gauges survive the reset
        assert_eq!(second.num_active, 1.into());
        assert_eq!(second.server, shard.server().clone());
    }
}
