// Error taxonomies for the session pool
// Network failures and remote faults are kept apart: a network failure never yields a session,
// a remote fault always does.

use std::time::Duration;
use thiserror::Error;

use crate::session::RemoteFault;

// The endpoint could not be reached or answered with something we cannot read
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Malformed response body: {0}")]
    MalformedBody(String),
}

// Classified outcome of a single create/close attempt
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Remote fault: {0}")]
    Fault(#[from] RemoteFault),
}

impl SessionError {
    pub fn is_network(&self) -> bool {
        matches!(self, SessionError::Network(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, SessionError::Fault(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("No session could be created ({attempts} attempts failed)")]
    NoSessions {
        attempts: usize,
        last_error: Option<NetworkError>,
    },

    #[error("Pool already populated")]
    AlreadyPopulated,

    #[error("Pool is closed")]
    Closed,

    #[error("Pool is full, session was not taken from this pool or was returned twice")]
    Full,

    #[error("No session available after {0:?}")]
    Timeout(Duration),

    #[error("Transport initialization error: {0}")]
    Transport(String),
}
