// Copyright 2021 Joyent, Inc.

//! A sharded connection pool for fanning out to a fleet of servers
//!
//! Shoal is a library for managing connections to a fleet of homogeneous
//! backend servers. Each server endpoint owns an independent *shard* that
//! keeps its own idle stack and in-flight accounting; the pool dispenses
//! connections round-robin across the shards that are in rotation and takes
//! them back when the caller is done, parking clean connections for reuse
//! and destroying broken ones.
//!
//! A background health prober tests servers that have accumulated a streak
//! of connection failures, or that are already out of rotation, by opening a
//! throwaway connection once a second. Probes move shards out of rotation
//! when the server stops answering and back in when it recovers, with one
//! restriction: at most one third of the fleet may be out of rotation at
//! once. When more servers than that misbehave the pool prefers degraded
//! service on possibly-sick servers over no service at all.
//!
//! ## Connections
//!
//! A *connection* is not necessarily just a TCP socket. It can be anything
//! that provides some kind of logical connection to a service, as long as it
//! implements the [`Connection`](connection/trait.Connection.html) trait.
//! Users provide the pool with a function to produce fresh, unopened
//! connections. The trait bounds established by the pool for this function
//! are as follows:
//! ```rust.ignore
//! Fn(&Endpoint, Duration, Duration) -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//! The function receives the server endpoint plus the connect and data
//! deadlines from the pool options and returns some instance of a
//! [`Connection`](connection/trait.Connection.html). The pool calls `open`
//! on the connection itself; the health prober uses the same function with
//! its own fixed deadlines.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//!
//! use slog::{o, Drain, Logger};
//!
//! use shoal::endpoint::Endpoint;
//! use shoal::pool::types::PoolOptions;
//! use shoal::pool::Pool;
//! use shoal_tcp_stream_connection::TcpStreamConnection;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let servers = vec![
//!     Endpoint::new("127.0.0.1", 6379),
//!     Endpoint::new("127.0.0.1", 6380),
//!     Endpoint::new("127.0.0.1", 6381),
//! ];
//!
//! let options = PoolOptions {
//!     max_idle: Some(10),
//!     max_active: Some(100),
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! let pool = Pool::new(servers, options, TcpStreamConnection::new);
//!
//! let conn = pool.acquire()?;
//! // Do stuff here
//! pool.release(conn, false)?;
//!
//! pool.shutdown();
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod shard;
