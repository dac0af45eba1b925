//! Shared pieces of the failover harness: the configuration format and the
//! logging stack used by the `failover-lib`, `failover` and e2e crates.

pub mod config;
pub mod logging;

pub use log::{debug, error, info, trace, warn};
