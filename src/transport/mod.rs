//! Transport boundary.
//!
//! The pool never touches sockets or wire formats directly. It talks to an
//! [`RpcClient`] per physical connection and asks a [`Connector`] for new
//! ones when it needs to (re)connect.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   connect()   ┌──────────────┐
//! │  ConnectionPool  │──────────────►│  Connector   │
//! │   supervisor     │◄──────────────│              │
//! └──────────────────┘ Arc<RpcClient>└──────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐  call/login/  ┌──────────────┐
//! │ConnectionHandler │──────────────►│  RpcClient   │──► server
//! │                  │◄──────────────│              │
//! └──────────────────┘   closed()    └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | JSON over WebSocket client and connector |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::protocol::methods;

// ============================================================================
// Submodules
// ============================================================================

/// JSON over WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use websocket::{WsClient, WsConnector};

// ============================================================================
// RpcClient
// ============================================================================

/// One live connection to the server.
///
/// Implementations must tolerate concurrent calls; the pool serializes its
/// own work but administrative broadcasts may overlap a queued request.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Returns `true` if `method` can be sent at all.
    ///
    /// Checked synchronously before dispatch; a `false` here fails the
    /// request without retry.
    fn supports(&self, method: &str) -> bool;

    /// Invokes a remote operation.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    /// Authenticates the connection.
    async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.call(methods::LOGIN, vec![serde_json::to_value(credentials)?])
            .await
            .map(drop)
    }

    /// Fetches the server API version string.
    async fn describe_version(&self) -> Result<String> {
        match self.call(methods::DESCRIBE_VERSION, Vec::new()).await? {
            Value::String(version) => Ok(version),
            other => Err(Error::protocol(format!(
                "describe_version returned non-string: {other}"
            ))),
        }
    }

    /// Selects the namespace used by subsequent calls.
    async fn set_namespace(&self, namespace: &str) -> Result<()> {
        self.call(methods::SET_NAMESPACE, vec![json!(namespace)])
            .await
            .map(drop)
    }

    /// Closes the connection. Outstanding calls fail.
    fn close(&self);

    /// Returns `true` while the connection is open.
    fn is_connected(&self) -> bool;

    /// Resolves once the connection is gone, with the reason.
    async fn closed(&self) -> Error;
}

// ============================================================================
// Connector
// ============================================================================

/// Produces new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens one physical connection.
    async fn connect(&self) -> Result<Arc<dyn RpcClient>>;
}

/// Returns `true` for names made of ASCII alphanumerics, `_` and `.`.
#[must_use]
pub fn is_valid_method_name(method: &str) -> bool {
    !method.is_empty()
        && method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_method_names() {
        assert!(is_valid_method_name("get_slice"));
        assert!(is_valid_method_name("system.describe_ring"));
        assert!(!is_valid_method_name(""));
        assert!(!is_valid_method_name("get slice"));
        assert!(!is_valid_method_name("drop;--"));
    }
}
