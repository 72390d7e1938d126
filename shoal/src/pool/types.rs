// Copyright 2021 Joyent, Inc.

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::endpoint::Endpoint;

/// A newtype wrapper around u32 used for counts of connections handled by a
/// pool shard.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// The configuration options for a shoal connection pool. This is required
/// to instantiate a new pool. Unset options fall back to the pool defaults.
#[derive(Debug)]
pub struct PoolOptions {
    /// An optional connect deadline in milliseconds handed to every
    /// connection the pool opens. If not specified the default is 100.
    pub conn_timeout_ms: Option<u64>,
    /// An optional data operation deadline in milliseconds handed to every
    /// connection the pool opens. If not specified the default is 100.
    pub data_timeout_ms: Option<u64>,
    /// An optional cap on the number of idle connections a shard parks. The
    /// least recently used idle connection is closed when a release would
    /// exceed the cap. If not specified the default is 10.
    pub max_idle: Option<usize>,
    /// An optional cap on the number of connections a shard may have in
    /// flight at once, idle or borrowed. Zero means no limit. If not
    /// specified the default is 100.
    pub max_active: Option<u32>,
    /// An optional count of consecutive connection failures after which a
    /// shard becomes suspect to the health prober. If not specified the
    /// default is 5.
    pub max_fails: Option<u32>,
    /// Whether an acquire on a shard that is at capacity blocks for a
    /// connection to be returned rather than failing fast. The default is
    /// false.
    pub wait: bool,
    /// An optional bound in milliseconds on how long a blocking acquire may
    /// wait. If not specified blocking acquires wait indefinitely.
    pub max_wait_ms: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            conn_timeout_ms: None,
            data_timeout_ms: None,
            max_idle: None,
            max_active: None,
            max_fails: None,
            wait: false,
            max_wait_ms: None,
            log: None,
        }
    }
}

/// A point-in-time readout of one shard's gauges and counters for a
/// monitor. Taking a snapshot zeroes the counters in place; `num_active` and
/// `available` are gauges and are left as they are.
#[derive(Clone, Debug)]
pub struct ShardStats {
    /// The endpoint the shard serves.
    pub server: Endpoint,
    /// Whether the shard was in rotation when the snapshot was taken.
    pub available: bool,
    /// The number of connections the shard currently owns, idle or borrowed.
    pub num_active: ConnectionCount,
    /// Acquire calls routed to the shard.
    pub num_get: ConnectionCount,
    /// Release calls routed to the shard.
    pub num_put: ConnectionCount,
    /// Connections handed back marked broken.
    pub num_broken: ConnectionCount,
    /// Connections the shard dialed.
    pub num_dial: ConnectionCount,
    /// Dial attempts that failed to open.
    pub num_dial_fail: ConnectionCount,
    /// Idle connections evicted to honor the idle cap.
    pub num_evict: ConnectionCount,
    /// Connections destroyed by the shard.
    pub num_close: ConnectionCount,
}
