//! Fault injection: terminate a random quarter of the backend connections

use rand::{rngs::StdRng, Rng, SeedableRng};

use failover_command_lib::{config::FaultMode, info};

use crate::{connection::ConnectionId, registry::ConnectionRegistry};

/// What one injection did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub mode: FaultMode,
    /// `expected / 4`, may be 0 for small pools
    pub batch_size: usize,
    pub terminated: Vec<ConnectionId>,
}

/// Owns the random source used to pick victims, so that a seeded injector
/// replays the same picks on the same registry
pub struct FaultInjector<R: Rng> {
    rng: R,
}

impl FaultInjector<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        FaultInjector::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        FaultInjector::new(StdRng::from_entropy())
    }
}

impl<R: Rng> FaultInjector<R> {
    pub fn new(rng: R) -> Self {
        FaultInjector { rng }
    }

    pub fn batch_size(expected: usize) -> usize {
        expected / 4
    }

    /// Terminates `expected / 4` connections. Every pick samples the registry
    /// as it is after the previous termination.
    pub fn inject(&mut self, registry: &mut ConnectionRegistry, mode: FaultMode) -> FaultReport {
        let batch_size = Self::batch_size(registry.expected());
        let mut terminated = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let Some(id) = registry.sample_random(1, &mut self.rng).pop() else {
                break;
            };
            if registry.close(id, mode) {
                terminated.push(id);
            }
        }

        info!(
            "{} injected on {}/{} connections, {} left",
            mode,
            terminated.len(),
            batch_size,
            registry.size()
        );
        FaultReport {
            mode,
            batch_size,
            terminated,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testing::SocketPairs;

    fn filled(pairs: &mut SocketPairs, n: u64) -> ConnectionRegistry {
        let mut registry = pairs.registry(n as usize);
        for i in 0..n {
            registry
                .register(pairs.connection(i, "server"))
                .expect("could not register");
        }
        registry
    }

    #[test]
    fn close_mode_terminates_a_quarter() {
        let mut pairs = SocketPairs::new();
        let mut registry = filled(&mut pairs, 8);
        let mut injector = FaultInjector::seeded(1);

        let report = injector.inject(&mut registry, FaultMode::Close);

        assert_eq!(report.batch_size, 2);
        assert_eq!(report.terminated.len(), 2);
        assert_eq!(registry.size(), 6);
        assert!(!registry.is_ready());
        for id in &report.terminated {
            assert!(!registry.contains(*id));
            assert!(pairs.peer_sees_eof(id.0));
        }
    }

    #[test]
    fn shutdown_mode_terminates_a_quarter() {
        let mut pairs = SocketPairs::new();
        let mut registry = filled(&mut pairs, 8);
        let mut injector = FaultInjector::seeded(2);

        let report = injector.inject(&mut registry, FaultMode::Shutdown);

        assert_eq!(report.mode, FaultMode::Shutdown);
        assert_eq!(registry.size(), 6);
        let distinct: HashSet<_> = report.terminated.iter().collect();
        assert_eq!(distinct.len(), 2);
        for id in &report.terminated {
            assert!(pairs.peer_sees_eof(id.0));
        }
    }

    #[test]
    fn small_pools_get_an_empty_batch() {
        let mut pairs = SocketPairs::new();
        let mut registry = filled(&mut pairs, 3);
        let mut injector = FaultInjector::seeded(3);

        let report = injector.inject(&mut registry, FaultMode::Close);
        assert_eq!(report.batch_size, 0);
        assert!(report.terminated.is_empty());
        assert!(registry.is_ready());

        let pairs = SocketPairs::new();
        let mut empty = pairs.registry(0);
        let report = injector.inject(&mut empty, FaultMode::Shutdown);
        assert!(report.terminated.is_empty());
        assert!(empty.is_ready());
    }

    #[test]
    fn shrunk_registry_bounds_the_batch() {
        let mut pairs = SocketPairs::new();
        let mut registry = filled(&mut pairs, 8);
        for i in 0..7 {
            registry.unregister(ConnectionId(i));
        }
        let mut injector = FaultInjector::seeded(4);

        let report = injector.inject(&mut registry, FaultMode::Close);
        assert_eq!(report.batch_size, 2);
        assert_eq!(report.terminated, vec![ConnectionId(7)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn same_seed_same_picks() {
        let mut first_pairs = SocketPairs::new();
        let mut first = filled(&mut first_pairs, 12);
        let mut second_pairs = SocketPairs::new();
        let mut second = filled(&mut second_pairs, 12);

        let first_report = FaultInjector::seeded(99).inject(&mut first, FaultMode::Close);
        let second_report = FaultInjector::seeded(99).inject(&mut second, FaultMode::Close);
        assert_eq!(first_report.terminated, second_report.terminated);
    }
}
