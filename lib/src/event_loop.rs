//! Single-threaded event loop
//!
//! One mio [`Poll`] watches every backend listener, every registered backend
//! connection and optional extra peers (client-side transports). Handlers
//! return a [`DispatchResult`]: a `Stop` from a registration that made the
//! registry ready ends [`EventLoop::loop_for`] at the end of the current
//! event batch. A loop that reaches its deadline returns normally, it is up
//! to the caller to check readiness.
//!
//! Token layout:
//!
//! ```plain
//! [0, PEER_TOKEN_START)                        listeners
//! [PEER_TOKEN_START, CONNECTION_TOKEN_START)   peers
//! [CONNECTION_TOKEN_START, ..)                 backend connections
//! ```

use std::{
    io::ErrorKind,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::{event::Event, net::TcpListener, Events, Interest, Poll, Registry, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use failover_command_lib::{debug, error, info, trace, warn};

use crate::{
    connection::{BackendConnection, ConnectionId, SocketResult},
    registry::{ConnectionRegistry, RegistryError, CONNECTION_TOKEN_START},
    DispatchResult,
};

pub const PEER_TOKEN_START: usize = 1 << 12;
const EVENTS_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum LoopError {
    #[error("could not create the poll instance: {0}")]
    PollCreation(std::io::Error),
    #[error("poll failed: {0}")]
    Poll(std::io::Error),
    #[error("could not clone the poll registry: {0}")]
    RegistryClone(std::io::Error),
    #[error("could not listen on {address}: {error}")]
    Listen {
        address: SocketAddr,
        error: std::io::Error,
    },
    #[error("too many {0}")]
    TokenSpace(&'static str),
    #[error("could not register peer {name}: {error}")]
    PeerRegistration {
        name: String,
        error: std::io::Error,
    },
    #[error("harness bug: {0}")]
    Registry(#[from] RegistryError),
}

/// How a call to [`EventLoop::loop_for`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// the registry holds the expected connection count
    Ready,
    /// a peer asked the loop to stop
    Stopped,
    TimedOut,
}

/// Readiness flags of one event, detached from the event buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventReadiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl From<&Event> for EventReadiness {
    fn from(event: &Event) -> Self {
        EventReadiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// A transport polled by the loop that is not a backend connection, usually
/// the client side that makes the proxy open its backend connections
pub trait Peer {
    fn name(&self) -> &str;
    fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()>;
    fn ready(&mut self, readiness: EventReadiness) -> DispatchResult;
}

/// A listening socket standing for one backend server
pub struct BackendListener {
    pub name: String,
    pub address: SocketAddr,
    listener: TcpListener,
}

/// Counters over the lifetime of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub accepted: usize,
    pub peer_closed: usize,
    pub transport_errors: usize,
    pub iterations: usize,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    poll_slice: Duration,
    listeners: Slab<BackendListener>,
    peers: Slab<Box<dyn Peer>>,
    next_connection_id: u64,
    stats: LoopStats,
}

impl EventLoop {
    /// `poll_slice` bounds each wait on the poll set
    pub fn new(poll_slice: Duration) -> Result<Self, LoopError> {
        Ok(EventLoop {
            poll: Poll::new().map_err(LoopError::PollCreation)?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            poll_slice,
            listeners: Slab::new(),
            peers: Slab::new(),
            next_connection_id: 0,
            stats: LoopStats::default(),
        })
    }

    /// creates the registry whose connections this loop will poll
    pub fn connection_registry(&self, expected: usize) -> Result<ConnectionRegistry, LoopError> {
        let poll_registry = self
            .poll
            .registry()
            .try_clone()
            .map_err(LoopError::RegistryClone)?;
        Ok(ConnectionRegistry::new(poll_registry, expected))
    }

    /// Binds a backend server and returns the address it actually listens
    /// on (port 0 picks a free port).
    pub fn add_listener<S: Into<String>>(
        &mut self,
        name: S,
        address: SocketAddr,
        backlog: u32,
    ) -> Result<SocketAddr, LoopError> {
        let entry = self.listeners.vacant_entry();
        if entry.key() >= PEER_TOKEN_START {
            return Err(LoopError::TokenSpace("listeners"));
        }
        let token = Token(entry.key());

        let listen_error = |error| LoopError::Listen { address, error };
        let mut listener = bind_listener(address, backlog).map_err(listen_error)?;
        let bound = listener.local_addr().map_err(listen_error)?;
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .map_err(listen_error)?;

        let name = name.into();
        info!("backend server {} listening on {}", name, bound);
        entry.insert(BackendListener {
            name,
            address: bound,
            listener,
        });
        Ok(bound)
    }

    pub fn listeners(&self) -> impl Iterator<Item = &BackendListener> {
        self.listeners.iter().map(|(_, listener)| listener)
    }

    pub fn add_peer(&mut self, mut peer: Box<dyn Peer>) -> Result<Token, LoopError> {
        let entry = self.peers.vacant_entry();
        let token = Token(PEER_TOKEN_START + entry.key());
        if token.0 >= CONNECTION_TOKEN_START {
            return Err(LoopError::TokenSpace("peers"));
        }
        peer.register(self.poll.registry(), token)
            .map_err(|error| LoopError::PeerRegistration {
                name: peer.name().to_owned(),
                error,
            })?;
        entry.insert(peer);
        Ok(token)
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Pumps I/O until the registry becomes ready, a peer stops the loop, or
    /// `timeout` has elapsed since the start of this call.
    pub fn loop_for(
        &mut self,
        registry: &mut ConnectionRegistry,
        timeout: Duration,
    ) -> Result<LoopOutcome, LoopError> {
        let start = Instant::now();

        // readiness is edge triggered: an accept loop that gave up on an error
        // leaves connections in the backlog without a new event
        let mut stop = false;
        for key in 0..self.listeners.capacity() {
            if self.listeners.contains(key) {
                stop |= self.accept_all(key, registry)? == DispatchResult::Stop;
            }
        }
        if stop || registry.is_ready() {
            debug!("ready before polling, {} connections", registry.size());
            return Ok(LoopOutcome::Ready);
        }

        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                info!(
                    "loop timed out after {:?} with {}/{} connections",
                    elapsed,
                    registry.size(),
                    registry.expected()
                );
                return Ok(LoopOutcome::TimedOut);
            }

            let slice = self.poll_slice.min(timeout - elapsed);
            if let Err(error) = self.poll.poll(&mut self.events, Some(slice)) {
                if error.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(LoopError::Poll(error));
            }
            self.stats.iterations += 1;

            let batch: Vec<(Token, EventReadiness)> = self
                .events
                .iter()
                .map(|event| (event.token(), EventReadiness::from(event)))
                .collect();

            let mut ready_signal = false;
            let mut peer_stop = false;
            for (token, readiness) in batch {
                trace!("event {:?}: {:?}", token, readiness);
                if token.0 < PEER_TOKEN_START {
                    ready_signal |= self.accept_all(token.0, registry)? == DispatchResult::Stop;
                } else if token.0 < CONNECTION_TOKEN_START {
                    peer_stop |= self.peer_ready(token, readiness) == DispatchResult::Stop;
                } else {
                    self.connection_ready(token, readiness, registry);
                }
            }

            if peer_stop {
                debug!("a peer stopped the loop");
                return Ok(LoopOutcome::Stopped);
            }
            if ready_signal {
                if registry.is_ready() {
                    return Ok(LoopOutcome::Ready);
                }
                debug!(
                    "readiness lost within the same batch, {}/{} connections",
                    registry.size(),
                    registry.expected()
                );
            }
        }
    }

    /// Accepts every pending connection of a listener
    fn accept_all(
        &mut self,
        key: usize,
        registry: &mut ConnectionRegistry,
    ) -> Result<DispatchResult, LoopError> {
        let Some(backend) = self.listeners.get_mut(key) else {
            warn!("event for unknown listener token {}", key);
            return Ok(DispatchResult::Continue);
        };

        let mut result = DispatchResult::Continue;
        loop {
            match backend.listener.accept() {
                Ok((socket, peer_address)) => {
                    let id = ConnectionId(self.next_connection_id);
                    self.next_connection_id += 1;
                    self.stats.accepted += 1;
                    trace!("{} accepted {} from {}", backend.name, id, peer_address);

                    let connection = BackendConnection::new(id, backend.name.as_str(), socket, peer_address);
                    match registry.register(connection) {
                        Ok(DispatchResult::Stop) => result = DispatchResult::Stop,
                        Ok(DispatchResult::Continue) => {}
                        Err(RegistryError::Poll { id, error }) => {
                            error!("dropping {}: {}", id, error);
                            self.stats.transport_errors += 1;
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        error!("{} could not accept: {}", backend.name, error);
                        break;
                    }
                },
            }
        }
        Ok(result)
    }

    fn peer_ready(&mut self, token: Token, readiness: EventReadiness) -> DispatchResult {
        match self.peers.get_mut(token.0 - PEER_TOKEN_START) {
            Some(peer) => peer.ready(readiness),
            None => {
                warn!("event for unknown peer token {:?}", token);
                DispatchResult::Continue
            }
        }
    }

    /// Closed or failing connections leave the registry, transport errors
    /// are a close like any other
    fn connection_ready(
        &mut self,
        token: Token,
        readiness: EventReadiness,
        registry: &mut ConnectionRegistry,
    ) {
        let Some(connection) = registry.get_mut_by_token(token) else {
            // closed earlier in the same batch
            trace!("event for unregistered connection token {:?}", token);
            return;
        };

        let mut result = connection.readable();
        if result == SocketResult::WouldBlock && readiness.error {
            result = SocketResult::Error;
        }

        let id = connection.id();
        match result {
            SocketResult::WouldBlock => {}
            SocketResult::Closed => {
                debug!("{} closed by the proxy", id);
                self.stats.peer_closed += 1;
                registry.unregister(id);
            }
            SocketResult::Error => {
                debug!("{} transport error, closing", id);
                self.stats.transport_errors += 1;
                registry.unregister(id);
            }
        }
    }
}

fn bind_listener(address: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}
