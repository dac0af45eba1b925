//! One backend-side TCP connection, opened by the proxy under test and
//! accepted by the harness

use std::{
    fmt,
    io::{ErrorKind, Read},
    net::{Shutdown, SocketAddr},
};

use mio::{net::TcpStream, Interest, Registry, Token};

use failover_command_lib::{debug, trace};

const READ_BUFFER_SIZE: usize = 16384;

/// Monotonic identity of an accepted connection, never reused within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// both directions shut down, local close pending
    Closing,
    Closed,
}

/// Outcome of a read on a backend socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketResult {
    WouldBlock,
    Closed,
    Error,
}

pub struct BackendConnection {
    id: ConnectionId,
    server: String,
    peer_address: SocketAddr,
    local_address: Option<SocketAddr>,
    socket: TcpStream,
    state: ConnectionState,
    token: Option<Token>,
    bytes_in: usize,
}

impl BackendConnection {
    pub fn new<S: Into<String>>(
        id: ConnectionId,
        server: S,
        socket: TcpStream,
        peer_address: SocketAddr,
    ) -> Self {
        let local_address = socket.local_addr().ok();
        BackendConnection {
            id,
            server: server.into(),
            peer_address,
            local_address,
            socket,
            state: ConnectionState::Open,
            token: None,
            bytes_in: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// name of the backend server that accepted the connection
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn bytes_in(&self) -> usize {
        self.bytes_in
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)?;
        self.token = Some(token);
        Ok(())
    }

    /// Drains the socket. The proxy may send requests on its backend
    /// connections, their content is not interpreted.
    pub fn readable(&mut self) -> SocketResult {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.socket.read(&mut buffer) {
                Ok(0) => {
                    trace!("{} from {}: end of stream", self.id, self.peer_address);
                    return SocketResult::Closed;
                }
                Ok(size) => self.bytes_in += size,
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => return SocketResult::WouldBlock,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        debug!("{} from {}: read error {}", self.id, self.peer_address, error);
                        return SocketResult::Error;
                    }
                },
            }
        }
    }

    /// Shuts down both directions: the proxy sees the connection reset or
    /// half-closed instead of an orderly local close.
    pub fn shutdown(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        if let Err(error) = self.socket.shutdown(Shutdown::Both) {
            debug!("{} could not shut down socket: {}", self.id, error);
        }
        self.state = ConnectionState::Closing;
    }

    /// Local close procedure: the socket leaves the poll set. The file
    /// descriptor itself is released when the connection is dropped.
    pub fn close(&mut self, registry: &Registry) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.token.take().is_some() {
            if let Err(error) = registry.deregister(&mut self.socket) {
                debug!("{} could not deregister socket: {}", self.id, error);
            }
        }
        self.state = ConnectionState::Closed;
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("peer_address", &self.peer_address)
            .field("state", &self.state)
            .field("token", &self.token)
            .field("bytes_in", &self.bytes_in)
            .finish()
    }
}
