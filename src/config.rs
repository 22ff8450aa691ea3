//! Pool configuration.
//!
//! Provides a type-safe interface for configuring a [`ConnectionPool`]:
//! the namespace selected on every connection, the retry budget, optional
//! credentials, API version checking and reconnection timing.
//!
//! # Example
//!
//! ```ignore
//! use rpc_pool::{Credentials, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .with_namespace("analytics")
//!     .with_retries(3)
//!     .with_credentials(Credentials::new().with("username", "app").with("password", "secret"))
//!     .with_api_version_check()
//!     .with_pool_size(4);
//!
//! config.validate()?;
//! ```
//!
//! [`ConnectionPool`]: crate::pool::ConnectionPool

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::{API_VERSION, ApiVersion};

// ============================================================================
// Constants
// ============================================================================

/// Default delay before the first reconnection attempt.
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on the reconnection delay.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Default growth factor between reconnection attempts.
pub const DEFAULT_RECONNECT_FACTOR: f64 = std::f64::consts::E;

// ============================================================================
// Credentials
// ============================================================================

/// Login credentials sent as a string map.
///
/// `Debug` output never includes the values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    /// Creates an empty credential set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key/value pair.
    #[inline]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns the value stored under `key`.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Namespace selected on every connection after the handshake.
    pub namespace: Option<String>,

    /// Retries allowed per request after the first attempt.
    pub retries: u32,

    /// Credentials; presence selects the authenticated handshake.
    pub credentials: Option<Credentials>,

    /// Verify the server API version during the handshake.
    pub check_api_version: bool,

    /// Local API version compared against the server's.
    pub api_version: String,

    /// Number of connections the pool keeps open.
    pub pool_size: usize,

    /// Delay before the first reconnection attempt.
    pub reconnect_initial_delay: Duration,

    /// Upper bound on the reconnection delay.
    pub reconnect_max_delay: Duration,

    /// Growth factor applied after each failed attempt.
    pub reconnect_factor: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            namespace: None,
            retries: 0,
            credentials: None,
            check_api_version: false,
            api_version: API_VERSION.to_string(),
            pool_size: 1,
            reconnect_initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            reconnect_factor: DEFAULT_RECONNECT_FACTOR,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolConfig {
    /// Sets the namespace selected on every connection.
    #[inline]
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the default retry budget.
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets login credentials.
    #[inline]
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Enables API version checking.
    #[inline]
    #[must_use]
    pub fn with_api_version_check(mut self) -> Self {
        self.check_api_version = true;
        self
    }

    /// Overrides the local API version.
    #[inline]
    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Sets the number of connections to maintain.
    #[inline]
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets reconnection timing.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max;
        self
    }

    /// Sets the reconnection growth factor.
    #[inline]
    #[must_use]
    pub fn with_reconnect_factor(mut self, factor: f64) -> Self {
        self.reconnect_factor = factor;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PoolConfig {
    /// Checks the configuration for values the pool cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::config("pool_size must be at least 1"));
        }

        self.local_api_version()?;

        if self.reconnect_factor.is_nan() || self.reconnect_factor < 1.0 {
            return Err(Error::config(format!(
                "reconnect_factor must be >= 1.0, got {}",
                self.reconnect_factor
            )));
        }

        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err(Error::config(format!(
                "reconnect_max_delay ({:?}) is below reconnect_initial_delay ({:?})",
                self.reconnect_max_delay, self.reconnect_initial_delay
            )));
        }

        Ok(())
    }

    /// Parses the configured local API version.
    pub(crate) fn local_api_version(&self) -> Result<ApiVersion> {
        self.api_version.parse().map_err(|_| {
            Error::config(format!("api_version {:?} is not major.minor.patch", self.api_version))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
