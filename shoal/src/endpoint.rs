// Copyright 2021 Joyent, Inc.

use std::fmt;

/// The port number for a backend server. This is a type alias for u16.
pub type Port = u16;

/// A backend server identified by host and port.
///
/// The pool is constructed over a fixed list of endpoints and builds one
/// shard per endpoint. Endpoints are immutable for the life of the pool.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    /// The host name or address of the server.
    pub host: String,
    /// The port of the server.
    pub port: Port,
}

impl Endpoint {
    /// Return a new instance of `Endpoint` given a host and a port.
    pub fn new(host: &str, port: Port) -> Self {
        Endpoint {
            host: String::from(host),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}
