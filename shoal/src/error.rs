// Copyright 2021 Joyent, Inc.

use std::error;
use std::fmt;

use crate::endpoint::Endpoint;

/// The errors surfaced by the connection pool. Transient connect failures
/// are swallowed at the shard boundary and show up only as reduced
/// availability; what reaches the caller is outright exhaustion of the
/// cross-shard retry budget or a broken release contract.
#[derive(Debug)]
pub enum Error {
    /// No shard produced a connection within the retry budget.
    AcquireExhausted {
        /// Number of shard attempts made.
        tries: u32,
        /// The endpoint of the last shard tried, if any shard was in
        /// rotation at all.
        last_tried: Option<Endpoint>,
    },
    /// The caller handed back a connection that does not belong to this
    /// pool.
    ContractViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AcquireExhausted { tries, last_tried } => match last_tried {
                Some(server) => write!(
                    fmt,
                    "failed to get connection after {} tries, last tried {}",
                    tries, server
                ),
                None => write!(
                    fmt,
                    "failed to get connection after {} tries, no shard available",
                    tries
                ),
            },
            Error::ContractViolation(err_str) => err_str.fmt(fmt),
        }
    }
}

impl error::Error for Error {}
