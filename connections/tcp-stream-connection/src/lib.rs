// Copyright 2021 Joyent, Inc.

use std::io::{Error as IOError, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use shoal::connection::Connection;
use shoal::endpoint::Endpoint;

/// A plain TCP stream usable as a shoal pool connection.
///
/// `TcpStreamConnection::new` matches the connection factory signature the
/// pool expects, so it can be handed to `Pool::new` directly. The connect
/// deadline bounds `open`; the data deadline is installed on the stream as
/// its read and write timeout.
#[derive(Debug)]
pub struct TcpStreamConnection {
    pub stream: Option<TcpStream>,
    server: Endpoint,
    conn_timeout: Duration,
    data_timeout: Duration,
    connected: bool,
}

impl TcpStreamConnection {
    pub fn new(server: &Endpoint, conn_timeout: Duration, data_timeout: Duration) -> Self {
        TcpStreamConnection {
            stream: None,
            server: server.clone(),
            conn_timeout,
            data_timeout,
            connected: false,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, IOError> {
        (self.server.host.as_str(), self.server.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                IOError::new(
                    ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", self.server),
                )
            })
    }
}

impl Connection for TcpStreamConnection {
    type Error = IOError;

    fn open(&mut self) -> Result<(), IOError> {
        let addr = self.socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, self.conn_timeout)?;
        stream.set_read_timeout(Some(self.data_timeout))?;
        stream.set_write_timeout(Some(self.data_timeout))?;
        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IOError> {
        self.stream = None;
        self.connected = false;
        Ok(())
    }
}

impl Deref for TcpStreamConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream.as_ref().unwrap()
    }
}

impl DerefMut for TcpStreamConnection {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().unwrap()
    }
}
