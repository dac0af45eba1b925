//! End-to-end failover scenarios, run against an in-process proxy double
//! that keeps a pool of connections to the harness backends.

pub mod mock;
pub mod tests;

pub const BUFFER_SIZE: usize = 4096;
