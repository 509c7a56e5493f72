//! Remote probe drivers.
//!
//! Supports SQL Server Agent job schedulers and ICMP reachability probes.

mod jobs;
mod mssql;
mod ping;

#[cfg(test)]
pub mod testing;

pub use jobs::*;
pub use mssql::*;
pub use ping::*;

use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// Connection, login or transport failure.
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    /// The remote server refused a statement for lack of privilege.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    /// A start/stop command was not accepted by the remote scheduler.
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
