//! Live set of backend connections
//!
//! Connections are kept in accept order and keyed by their
//! [`ConnectionId`]. Only open or closing connections are members: the close
//! procedure removes a connection in the same call that closes it. The
//! registry also knows how many connections the proxy is expected to hold,
//! which gives the readiness predicate `size() == expected()`.

use std::collections::{BTreeMap, HashMap};

use mio::{Registry, Token};
use rand::{seq::SliceRandom, Rng};
use slab::Slab;

use failover_command_lib::{config::FaultMode, debug, info};

use crate::{
    connection::{BackendConnection, ConnectionId},
    DispatchResult,
};

/// Tokens below this value belong to listeners and peers
pub const CONNECTION_TOKEN_START: usize = 1 << 16;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateRegistration(ConnectionId),
    #[error("could not register connection {id} in the poll set: {error}")]
    Poll {
        id: ConnectionId,
        error: std::io::Error,
    },
}

pub struct ConnectionRegistry {
    poll_registry: Registry,
    expected: usize,
    connections: Slab<BackendConnection>,
    by_id: HashMap<ConnectionId, usize>,
    /// accept order
    order: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    /// `poll_registry` is a handle on the event loop's poll set, the
    /// connections register their sockets there
    pub fn new(poll_registry: Registry, expected: usize) -> Self {
        ConnectionRegistry {
            poll_registry,
            expected,
            connections: Slab::new(),
            by_id: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.size() == self.expected
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&BackendConnection> {
        self.by_id.get(&id).and_then(|key| self.connections.get(*key))
    }

    /// identities in accept order
    pub fn ids(&self) -> &[ConnectionId] {
        &self.order
    }

    /// Adds an accepted connection and registers its socket for reads.
    /// Returns [`DispatchResult::Stop`] once the expected count is reached.
    pub fn register(&mut self, mut connection: BackendConnection) -> Result<DispatchResult, RegistryError> {
        let id = connection.id();
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateRegistration(id));
        }

        let entry = self.connections.vacant_entry();
        let token = Token(CONNECTION_TOKEN_START + entry.key());
        connection
            .register(&self.poll_registry, token)
            .map_err(|error| RegistryError::Poll { id, error })?;

        debug!(
            "registered {} on {} ({:?}) from {} ({:?})",
            id,
            connection.server(),
            connection.local_address(),
            connection.peer_address(),
            token
        );
        let key = entry.key();
        entry.insert(connection);
        self.by_id.insert(id, key);
        self.order.push(id);

        if self.is_ready() {
            info!("{} backend connections established", self.size());
            Ok(DispatchResult::Stop)
        } else {
            Ok(DispatchResult::Continue)
        }
    }

    /// Closes and removes a connection. Absent connections are ignored so
    /// that a double close is harmless. Returns whether it was a member.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        let Some(key) = self.by_id.remove(&id) else {
            return false;
        };
        self.order.retain(|member| *member != id);

        let mut connection = self.connections.remove(key);
        connection.close(&self.poll_registry);
        debug!(
            "unregistered {} on {}, {} connections left",
            id,
            connection.server(),
            self.size()
        );
        true
    }

    /// Local termination of a connection, used by fault injection. In
    /// shutdown mode both directions are shut down before the close.
    pub fn close(&mut self, id: ConnectionId, mode: FaultMode) -> bool {
        let Some(key) = self.by_id.get(&id).copied() else {
            return false;
        };
        if mode == FaultMode::Shutdown {
            if let Some(connection) = self.connections.get_mut(key) {
                connection.shutdown();
            }
        }
        self.unregister(id)
    }

    pub fn close_all(&mut self) {
        let ids = std::mem::take(&mut self.order);
        for id in ids {
            if let Some(key) = self.by_id.remove(&id) {
                let mut connection = self.connections.remove(key);
                connection.close(&self.poll_registry);
            }
        }
    }

    /// Up to `n` distinct connections chosen uniformly from the current
    /// members, all of them if there are fewer than `n`.
    pub fn sample_random<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<ConnectionId> {
        self.order.choose_multiple(rng, n).copied().collect()
    }

    pub fn id_for_token(&self, token: Token) -> Option<ConnectionId> {
        let key = token.0.checked_sub(CONNECTION_TOKEN_START)?;
        self.connections.get(key).map(BackendConnection::id)
    }

    pub fn get_mut_by_token(&mut self, token: Token) -> Option<&mut BackendConnection> {
        let key = token.0.checked_sub(CONNECTION_TOKEN_START)?;
        self.connections.get_mut(key)
    }

    /// live connection count per backend server
    pub fn per_server_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, connection) in self.connections.iter() {
            *counts.entry(connection.server().to_owned()).or_insert(0) += 1;
        }
        counts
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
