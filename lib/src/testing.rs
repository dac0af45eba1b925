//! Connected socket pairs for unit tests: the accepted side becomes a
//! [`BackendConnection`], the connecting side plays the proxy.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read},
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use mio::Poll;

use crate::{
    connection::{BackendConnection, ConnectionId},
    registry::ConnectionRegistry,
};

pub(crate) struct SocketPairs {
    listener: TcpListener,
    poll: Poll,
    peers: HashMap<u64, TcpStream>,
}

impl SocketPairs {
    pub(crate) fn new() -> Self {
        SocketPairs {
            listener: TcpListener::bind("127.0.0.1:0").expect("could not bind test listener"),
            poll: Poll::new().expect("could not create poll"),
            peers: HashMap::new(),
        }
    }

    pub(crate) fn registry(&self, expected: usize) -> ConnectionRegistry {
        let poll_registry = self
            .poll
            .registry()
            .try_clone()
            .expect("could not clone poll registry");
        ConnectionRegistry::new(poll_registry, expected)
    }

    pub(crate) fn connection(&mut self, id: u64, server: &str) -> BackendConnection {
        let address: SocketAddr = self
            .listener
            .local_addr()
            .expect("could not get listener address");
        let peer = TcpStream::connect(address).expect("could not connect");
        let (accepted, peer_address) = self.listener.accept().expect("could not accept");
        accepted
            .set_nonblocking(true)
            .expect("could not set nonblocking");
        self.peers.insert(id, peer);
        BackendConnection::new(
            ConnectionId(id),
            server,
            mio::net::TcpStream::from_std(accepted),
            peer_address,
        )
    }

    /// whether the connecting side observes the connection going away
    pub(crate) fn peer_sees_eof(&mut self, id: u64) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        peer.set_read_timeout(Some(Duration::from_secs(1)))
            .expect("could not set read timeout");
        let mut buffer = [0u8; 16];
        match peer.read(&mut buffer) {
            Ok(0) => true,
            Ok(_) => false,
            Err(error) => matches!(
                error.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
        }
    }
}
