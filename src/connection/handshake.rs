//! Connection setup sequence.
//!
//! A handshake is an ordered list of [`HandshakeStep`]s run one after the
//! other; the first failure aborts the rest. The strategy ([`Handshake`])
//! decides whether the list starts with a login.
//!
//! | Strategy | Steps |
//! |----------|-------|
//! | `Plain` | [version check], [namespace] |
//! | `Authenticated` | login, [version check], [namespace] |
//!
//! Bracketed steps depend on configuration.

// ============================================================================
// Imports
// ============================================================================

use tracing::debug;

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::RpcClient;
use crate::version::ApiVersion;

// ============================================================================
// Handshake
// ============================================================================

/// Handshake strategy, resolved once when the pool is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// No authentication.
    Plain,
    /// Log in before anything else.
    Authenticated(Credentials),
}

impl Handshake {
    /// Picks the strategy: credentials present means authenticated.
    #[inline]
    #[must_use]
    pub fn from_credentials(credentials: Option<Credentials>) -> Self {
        match credentials {
            Some(credentials) => Self::Authenticated(credentials),
            None => Self::Plain,
        }
    }

    /// Builds the ordered step list for one connection.
    #[must_use]
    pub fn steps(&self, settings: &HandshakeSettings) -> Vec<HandshakeStep> {
        let mut steps = Vec::with_capacity(3);

        if let Self::Authenticated(credentials) = self {
            steps.push(HandshakeStep::Login(credentials.clone()));
        }

        if let Some(local) = settings.check_api_version {
            steps.push(HandshakeStep::CheckVersion(local));
        }

        if let Some(namespace) = &settings.namespace {
            steps.push(HandshakeStep::SelectNamespace(namespace.clone()));
        }

        steps
    }
}

// ============================================================================
// HandshakeSettings
// ============================================================================

/// Per-connection inputs to the handshake, snapshotted at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeSettings {
    /// Local version to check against; `None` skips the check.
    pub check_api_version: Option<ApiVersion>,
    /// Namespace to select; `None` skips selection.
    pub namespace: Option<String>,
}

// ============================================================================
// HandshakeStep
// ============================================================================

/// One step of the setup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send credentials.
    Login(Credentials),
    /// Fetch and compare the server API version.
    CheckVersion(ApiVersion),
    /// Select a namespace.
    SelectNamespace(String),
}

impl HandshakeStep {
    /// Runs this step against `client`.
    ///
    /// # Errors
    ///
    /// - Whatever the client returns for the underlying call
    /// - [`Error::ApiMismatch`] if the server version is incompatible
    pub async fn execute(&self, client: &dyn RpcClient) -> Result<()> {
        match self {
            Self::Login(credentials) => client.login(credentials).await,
            Self::CheckVersion(local) => {
                let remote = client.describe_version().await?;
                let compatible = remote
                    .parse::<ApiVersion>()
                    .is_ok_and(|remote| local.accepts(&remote));

                if compatible {
                    Ok(())
                } else {
                    Err(Error::api_mismatch(local.to_string(), remote))
                }
            }
            Self::SelectNamespace(namespace) => client.set_namespace(namespace).await,
        }
    }

    /// Short name for logging.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::CheckVersion(_) => "check_version",
            Self::SelectNamespace(_) => "select_namespace",
        }
    }
}

/// Runs `steps` in order, stopping at the first failure.
///
/// # Errors
///
/// Returns the failing step's error unchanged.
pub async fn run(
    connection_id: ConnectionId,
    client: &dyn RpcClient,
    steps: &[HandshakeStep],
) -> Result<()> {
    for step in steps {
        step.execute(client).await?;
        debug!(%connection_id, step = step.name(), "Handshake step completed");
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
