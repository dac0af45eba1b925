//! Harness logs
//!
//! The harness crates log through the `log` facade. This module provides the
//! logger behind it: one line per record, prefixed with a timestamp, the pid
//! and a tag naming the process (`FAILOVER`, `E2E`...), written to stdout,
//! stderr or a file.
//!
//! Debug logs are only kept in debug builds or with the `logs-debug` feature,
//! trace logs only with `logs-trace`, whatever the configured level.

pub mod logs;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log level {0}")]
    InvalidLogLevel(String),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("a logger is already installed")]
    AlreadyInstalled,
}
