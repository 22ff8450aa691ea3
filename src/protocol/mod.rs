//! Wire message types for the bundled transport.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Client → Server | Remote call |
//! | `Response` | Server → Client | Call result or classified error |
//!
//! Messages are JSON text frames. Responses are correlated to requests by
//! `id`; several calls may be outstanding on one socket.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | Request and Response types |

// ============================================================================
// Submodules
// ============================================================================

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use request::{Request, Response, ResponseType};

// ============================================================================
// Built-in Methods
// ============================================================================

/// Methods every server implements for connection setup.
pub mod methods {
    /// Authenticate the connection. Params: `[credentials]`.
    pub const LOGIN: &str = "login";

    /// Report the server API version. Result: `"major.minor.patch"`.
    pub const DESCRIBE_VERSION: &str = "describe_version";

    /// Select the data namespace for subsequent calls. Params: `[name]`.
    pub const SET_NAMESPACE: &str = "set_namespace";
}

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes with dedicated client-side handling.
pub mod codes {
    /// Call rejected semantically; never retried.
    pub const INVALID_REQUEST: &str = "invalid_request";

    /// Method does not exist; never retried.
    pub const UNKNOWN_METHOD: &str = "unknown_method";

    /// Login rejected.
    pub const AUTHENTICATION: &str = "authentication";
}
