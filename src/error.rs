//! Error types for the benchd control plane.
//!
//! Adapter and service failures are reported as one of a fixed set of
//! kinds; the API boundary maps each kind to a stable HTTP status class
//! via [`Error::status_code`]. The service propagates adapter errors 1:1
//! and never retries.

use crate::model::Backend;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resource kinds used by [`Error::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Session,
    Program,
    Snapshot,
    CosimSession,
    CosimMember,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Resource::Session => "session",
            Resource::Program => "program",
            Resource::Snapshot => "snapshot",
            Resource::CosimSession => "co-simulation session",
            Resource::CosimMember => "co-simulation member",
        };
        f.write_str(name)
    }
}

/// Failure kinds surfaced by the control core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("maximum number of sessions reached (limit {0})")]
    CapacityExhausted(usize),

    #[error("{0} not found: {1}")]
    NotFound(Resource, String),

    #[error("no adapter registered for backend: {0}")]
    BackendUnknown(Backend),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: Backend,
        operation: &'static str,
    },

    #[error("co-simulation session is not running: {0}")]
    NotRunning(String),

    #[error("failed to start backend: {0}")]
    Spawn(String),

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("durable store error: {0}")]
    Persist(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for session lookups, the most common miss.
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Error::NotFound(Resource::Session, id.into())
    }

    /// Stable HTTP status mapping used by the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::CapacityExhausted(_) => 429,
            Error::NotFound(..) => 404,
            Error::BackendUnknown(_) => 400,
            Error::Unsupported { .. } => 422,
            Error::NotRunning(_) => 409,
            Error::Spawn(_) => 500,
            Error::Transport(_) => 502,
            Error::Persist(_) => 500,
            // Nginx convention for client-abandoned requests.
            Error::Cancelled => 499,
            Error::Internal(_) => 500,
        }
    }

    /// True for kinds the boundary reports as client errors.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}
