//! Error kinds shared across the framework core
//!
//! Errors carry a tag describing which layer produced them so callers can
//! decide between terminating a session, reconnecting a database link, or
//! surfacing the failure to the registering module. Only one condition in the
//! whole core is treated as unrecoverable: starting a second database daemon
//! while one is already running, which aborts the process.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the framework core
#[derive(Debug, Error)]
pub enum Error {
    /// An errno-bearing failure from a socket or fd operation
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// A logical protocol violation, such as an unknown address family
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A TLS handshake or record-layer failure
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A second live servlet registration for the same URI
    #[error("duplicate servlet for URI {0}")]
    DuplicateServlet(String),

    /// A failure reported by the database layer
    #[error(transparent)]
    Sql(#[from] MySqlError),
}

/// Error value produced by database connections and persistable objects
///
/// Mirrors what SQL drivers report: a numeric error code, the five-character
/// SQLSTATE, and a message, scoped to the schema the connection was using.
/// The daemon logs all three fields and discards the connection when it sees
/// one of these.
#[derive(Debug, Clone, Error)]
#[error("schema = {schema}, code = {code}, state = {state}, message = {message}")]
pub struct MySqlError {
    /// Schema (database name) the failing connection was bound to
    pub schema: Arc<str>,
    /// Driver error code
    pub code: u32,
    /// Five-character SQLSTATE
    pub state: String,
    /// Human-readable message from the driver
    pub message: String,
}

impl MySqlError {
    /// Creates an error value from its parts
    pub fn new(
        schema: impl Into<Arc<str>>,
        code: u32,
        state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            code,
            state: state.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_error_display_carries_all_fields() {
        let e = MySqlError::new("game", 1213, "40001", "deadlock found");
        let text = e.to_string();
        assert!(text.contains("game"));
        assert!(text.contains("1213"));
        assert!(text.contains("40001"));
        assert!(text.contains("deadlock found"));
    }

    #[test]
    fn test_io_error_converts_to_system_kind() {
        let e: Error = io::Error::from_raw_os_error(libc::ECONNRESET).into();
        assert!(matches!(e, Error::System(_)));
    }
}
