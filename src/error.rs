//! Error types for the regpoll coordinator
//!
//! Transport errors describe what went wrong on the wire; the coordinator
//! layers map them into the caller-facing taxonomies (connection, acquisition,
//! write). Tick failures are transient by design: the previously published
//! snapshot stays authoritative and the fixed poll interval is the retry
//! mechanism.

use std::time::Duration;

use thiserror::Error;

use crate::snapshot::RegisterSpace;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost mid-operation
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation attempted without an open connection
    #[error("Not connected")]
    NotConnected,

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Protocol-level rejection (exception response, malformed reply)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Connection lifecycle errors reported by [`crate::ConnectionManager`]
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The device could not be reached
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The coordinator is paused; no connection attempts are made
    #[error("Coordinator is paused")]
    Paused,
}

/// Acquisition cycle errors
///
/// Any of these aborts the whole cycle: the staging buffer is discarded and
/// the previously published snapshot remains authoritative.
#[derive(Error, Debug, Clone)]
pub enum AcquisitionError {
    /// One of the four register space reads failed mid-cycle
    #[error("{space} read failed: {detail}")]
    PartialReadFailure {
        space: RegisterSpace,
        detail: String,
    },

    /// The cycle exceeded the acquisition timeout
    #[error("Acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// Write path errors
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    /// Connection could not be established (or the coordinator is paused)
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The device rejected the write round-trip
    #[error("Write rejected: {0}")]
    TransportRejected(String),

    /// The write itself succeeded but the forced resynchronization failed;
    /// the published snapshot may lag the device until the next scheduled tick
    #[error("Post-write resynchronization failed: {0}")]
    ResyncFailed(String),
}

impl From<ConnectionError> for WriteError {
    fn from(err: ConnectionError) -> Self {
        WriteError::Unreachable(err.to_string())
    }
}

/// Per-tick failure report for a scheduled or forced update
#[derive(Error, Debug, Clone)]
pub enum UpdateError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

/// Configuration and bootstrap errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Load(String),

    /// Configuration parsed but failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Logging subsystem could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_read_failure_display() {
        let err = AcquisitionError::PartialReadFailure {
            space: RegisterSpace::HoldingRegisters,
            detail: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("holding registers"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_paused_maps_to_write_unreachable() {
        let err = WriteError::from(ConnectionError::Paused);
        assert!(matches!(err, WriteError::Unreachable(_)));
        assert!(err.to_string().contains("paused"));
    }
}
