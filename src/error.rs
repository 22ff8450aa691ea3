//! Error types for the RPC connection pool.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use rpc_pool::{Error, Result};
//!
//! async fn example(pool: &ConnectionPool) -> Result<()> {
//!     let rows = pool.call("get_slice", vec![json!("users"), json!("alice")]).await?;
//!     println!("{rows}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Retryable |
//! |----------|----------|-----------|
//! | Setup | [`Error::Setup`], [`Error::ApiMismatch`], [`Error::Authentication`] | n/a |
//! | Dispatch | [`Error::Busy`] | yes |
//! | Application | [`Error::InvalidRequest`], [`Error::InvalidMethod`] | no |
//! | Remote | [`Error::Remote`] | yes |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ConnectionTimeout`] | yes |
//! | Pool | [`Error::Shutdown`], [`Error::Broadcast`] | no |
//! | Configuration | [`Error::Config`], [`Error::Protocol`] | no / yes |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] | yes |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Setup Errors
    // ========================================================================
    /// Connection handshake failed.
    ///
    /// The connection is discarded before joining the pool. Only surfaced
    /// through the pool readiness signal.
    #[error("Connection setup failed: {0}")]
    Setup(#[source] Box<Error>),

    /// Remote API version is not compatible with the local one.
    #[error("API mismatch: remote {remote} is not compatible with local {local}")]
    ApiMismatch {
        /// Version this client was built against.
        local: String,
        /// Version reported by the server.
        remote: String,
    },

    /// Login was rejected by the server.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Server-provided reason.
        message: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// Submission against a connection that already has a request in flight.
    #[error("Connection busy: a request is already in flight")]
    Busy,

    // ========================================================================
    // Application Errors
    // ========================================================================
    /// The server rejected the call semantically.
    ///
    /// Never retried.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Server-provided reason.
        message: String,
    },

    /// The requested remote operation does not exist.
    ///
    /// Never retried.
    #[error("Invalid method: {method}")]
    InvalidMethod {
        /// The unrecognized method name.
        method: String,
    },

    /// Any other failure reported by the server (unavailable, timed out...).
    #[error("Remote error [{code}]: {message}")]
    Remote {
        /// Error code from the response.
        code: String,
        /// Error message from the response.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Connection-level failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection attempt did not complete in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while a call was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Pool Errors
    // ========================================================================
    /// The pool was shut down before the request resolved.
    #[error("Shutdown requested")]
    Shutdown,

    /// At least one connection failed a broadcast operation.
    #[error("Broadcast failed on {failed} of {total} connections: {source}")]
    Broadcast {
        /// Number of connections that failed.
        failed: usize,
        /// Number of connections the broadcast was sent to.
        total: usize,
        /// First failure observed.
        #[source]
        source: Box<Error>,
    },

    // ========================================================================
    // Configuration / Protocol Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Protocol violation or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Wraps a handshake failure.
    #[inline]
    pub fn setup(source: Error) -> Self {
        Self::Setup(Box::new(source))
    }

    /// Creates an API mismatch error.
    #[inline]
    pub fn api_mismatch(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self::ApiMismatch {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Creates an authentication error.
    #[inline]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[inline]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an invalid method error.
    #[inline]
    pub fn invalid_method(method: impl Into<String>) -> Self {
        Self::InvalidMethod {
            method: method.into(),
        }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a broadcast error from the first failure.
    #[inline]
    pub fn broadcast(failed: usize, total: usize, source: Error) -> Self {
        Self::Broadcast {
            failed,
            total,
            source: Box::new(source),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if a failed request may be attempted again.
    ///
    /// Application rejections and pool-level outcomes are final; everything
    /// else, transport faults included, is subject to the retry budget.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidRequest { .. }
                | Self::InvalidMethod { .. }
                | Self::Shutdown
                | Self::Config { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error came out of a connection handshake.
    #[inline]
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Setup(_) | Self::ApiMismatch { .. } | Self::Authentication { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("reset by peer");
        assert_eq!(err.to_string(), "Connection failed: reset by peer");

        let err = Error::api_mismatch("2.1.0", "3.0.0");
        assert_eq!(
            err.to_string(),
            "API mismatch: remote 3.0.0 is not compatible with local 2.1.0"
        );
    }

    #[test]
    fn test_setup_wraps_source() {
        let err = Error::setup(Error::authentication("bad password"));
        assert!(err.is_setup_error());
        assert_eq!(
            err.to_string(),
            "Connection setup failed: Authentication failed: bad password"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::connection("boom").is_retryable());
        assert!(Error::remote("unavailable", "not enough replicas").is_retryable());
        assert!(Error::Busy.is_retryable());

        assert!(!Error::invalid_request("bad column").is_retryable());
        assert!(!Error::invalid_method("drop_everything").is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::connection_timeout(1000).is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_broadcast_display() {
        let err = Error::broadcast(1, 3, Error::ConnectionClosed);
        assert_eq!(
            err.to_string(),
            "Broadcast failed on 1 of 3 connections: Connection closed"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
