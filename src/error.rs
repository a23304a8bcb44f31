//! Error types for pathsteer.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Result type alias for pathsteer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pathsteer.
#[derive(Error, Debug)]
pub enum Error {
    // Probe errors
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    // Routing errors
    #[error("route error: {0}")]
    Route(#[from] RouteError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Probe (ICMP socket and packet) errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to open {family} ICMP socket: {reason}")]
    SocketUnavailable { family: &'static str, reason: String },

    #[error("send to {addr} failed: {reason}")]
    SendFailed { addr: IpAddr, reason: String },

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("malformed ICMP message: {0}")]
    Malformed(String),

    #[error("payload too small: {size} bytes (min {min})")]
    PayloadTooSmall { size: usize, min: usize },
}

/// Route table manipulation errors.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("failed to add route {destination} dev {interface}: {reason}")]
    AddFailed {
        destination: String,
        interface: String,
        reason: String,
    },

    #[error("failed to delete route {destination} dev {interface}: {reason}")]
    DeleteFailed {
        destination: String,
        interface: String,
        reason: String,
    },

    #[error("failed to replace route {destination} dev {interface}: {reason}")]
    ReplaceFailed {
        destination: String,
        interface: String,
        reason: String,
    },

    #[error("route {destination} is owned by foreign interface {interface}")]
    ExternalConflict { destination: String, interface: String },

    #[error("route lookup failed: {0}")]
    LookupFailed(String),

    #[error("route management not supported on this platform")]
    Unsupported,
}

impl Error {
    /// Check if the error is transient (log, count, and carry on).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Probe(
                    ProbeError::SendFailed { .. }
                        | ProbeError::ReceiveFailed(_)
                        | ProbeError::Malformed(_)
                )
                | Error::Route(
                    RouteError::AddFailed { .. }
                        | RouteError::DeleteFailed { .. }
                        | RouteError::ReplaceFailed { .. }
                        | RouteError::LookupFailed(_)
                )
        )
    }

    /// Check if the error is a conflict with a route this agent does not own.
    pub fn is_external_conflict(&self) -> bool {
        matches!(self, Error::Route(RouteError::ExternalConflict { .. }))
    }
}
