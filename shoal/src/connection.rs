// Copyright 2021 Joyent, Inc.

use std::error;
use std::ops::{Deref, DerefMut};

/// Shoal connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a shoal connection pool. A connection need not be
/// limited to a TCP socket, but could be any logical notion of a connection
/// that implements the `Connection` trait.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `open` or `close` functions. This is an
    /// associated type for the trait meaning each specific implementation of
    /// the `Connection` trait may choose the appropriate concrete error type
    /// to return. The only constraint applied is that the selected error type
    /// must implement the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait
    /// from the standard library. This allows for the error to be relevant to
    /// the context of the `Connection` implementation while avoiding
    /// unnecessary type parameters or having to coerce data between
    /// incompatible error types.
    type Error: error::Error;
    /// Attempt to establish the underlying transport to the backend
    /// server. The pool invokes this exactly once per connection it dials,
    /// with the timeouts from the pool options already captured by the
    /// connection when the pool's `create_connection` function produced it.
    fn open(&mut self) -> Result<(), Self::Error>;
    /// Close the connection to the backend.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A connection dispensed by the pool.
///
/// Wraps the caller's `Connection` together with the pool bookkeeping: the
/// index of the shard that owns the connection and whether the connection is
/// currently borrowed by a caller. The wrapper dereferences to the underlying
/// connection. Hand it back with `Pool::release` when done with it.
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
    owner: usize,
    borrowed: bool,
}

impl<C> PooledConnection<C>
where
    C: Connection,
{
    // Freshly dialed connections go straight to the caller, so they start
    // out borrowed.
    pub(crate) fn new(conn: C, owner: usize) -> Self {
        PooledConnection {
            conn,
            owner,
            borrowed: true,
        }
    }

    /// The index of the shard this connection belongs to. A connection is
    /// owned by exactly one shard for its whole life.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Whether the connection is currently held by a caller outside the
    /// pool.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    pub(crate) fn set_borrowed(&mut self, borrowed: bool) {
        self.borrowed = borrowed;
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}
