//! RPC Pool - Pooled, self-healing RPC client connections.
//!
//! This library keeps a fixed number of connections to an RPC service open,
//! spreads queued calls over them and retries calls that failed for
//! transient reasons.
//!
//! # Architecture
//!
//! The pool sits between callers and the transport:
//!
//! - **Callers**: push requests, await a [`PendingResponse`]
//! - **Pool**: FIFO queue, idle connections, retry classification
//! - **Connections**: one request in flight each, handshake on connect
//!
//! Key design principles:
//!
//! - Each [`ConnectionHandler`] owns one transport and at most one request
//! - Every pushed request resolves exactly once
//! - Lost connections are replaced with exponential backoff
//! - Namespace and credential changes reach current and future connections
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rpc_pool::{ConnectionPool, Credentials, PoolConfig, Result, WsConnector};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connector = Arc::new(WsConnector::new("ws://127.0.0.1:9160")?);
//!
//!     let config = PoolConfig::new()
//!         .with_namespace("users")
//!         .with_credentials(Credentials::new().with("username", "app"))
//!         .with_api_version_check()
//!         .with_pool_size(4)
//!         .with_retries(2);
//!
//!     let pool = ConnectionPool::connect(config, connector).await?;
//!
//!     let row = pool.call("get", vec![json!("alice")]).await?;
//!     println!("row: {row}");
//!
//!     pool.set_namespace("archive").await?;
//!     pool.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Pool configuration and credentials |
//! | [`connection`] | Per-connection lifecycle and handshake |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request and connection IDs |
//! | [`pool`] | Pool manager, queue and backoff |
//! | [`protocol`] | Wire message types |
//! | [`transport`] | Client traits and the WebSocket transport |
//! | [`version`] | API version compatibility |

// ============================================================================
// Modules
// ============================================================================

/// Pool configuration.
///
/// Use [`PoolConfig::new()`] and the `with_*` methods.
pub mod config;

/// Per-connection lifecycle.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Pool manager.
///
/// - [`ConnectionPool`] - queue, members and supervisors
/// - [`PendingResponse`] - caller-side result handle
pub mod pool;

/// Wire message types.
pub mod protocol;

/// Client traits and the WebSocket transport.
pub mod transport;

/// API version compatibility.
pub mod version;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{Credentials, PoolConfig};

// Connection types
pub use connection::{ConnectionEvents, ConnectionHandler, ConnectionState, Handshake};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, RequestId};

// Pool types
pub use pool::{Backoff, ConnectionPool, PendingResponse};

// Transport types
pub use transport::{Connector, RpcClient, WsClient, WsConnector};

// Version helpers
pub use version::{API_VERSION, ApiVersion, match_api_version};
