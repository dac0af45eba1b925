//! Harness checking that a proxy restores its backend connection pool
//!
//! The harness plays the backend servers: it accepts the connections the
//! proxy under test opens, terminates a random quarter of them, and checks
//! that the proxy opens replacements until the pool is back to its expected
//! size.
//!
//! - [`registry::ConnectionRegistry`] holds the live backend connections
//! - [`fault::FaultInjector`] terminates a random batch of them
//! - [`event_loop::EventLoop`] accepts and watches connections on one thread
//! - [`orchestrator::Orchestrator`] runs the scenario and asserts on counts

pub mod connection;
pub mod controller;
pub mod event_loop;
pub mod fault;
pub mod metrics;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

/// What a handler tells the event loop after processing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Continue,
    Stop,
}
