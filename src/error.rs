//! Error types for cli-auth
//!
//! Components return their own narrow errors ([`CallbackError`],
//! [`BrowserError`], [`ExchangeError`], [`StoreError`], [`ConfigError`]).
//! The login orchestration, the [`Session`](crate::Session) and the
//! [`AuthenticatedClient`](crate::AuthenticatedClient) map them into
//! [`AuthError`], which is the only error a caller has to reason about.
//!
//! [`CallbackError`]: crate::auth::CallbackError
//! [`BrowserError`]: crate::auth::BrowserError
//! [`ExchangeError`]: crate::auth::ExchangeError
//! [`StoreError`]: crate::auth::StoreError
//! [`ConfigError`]: crate::config::ConfigError

use std::time::Duration;
use thiserror::Error;

use crate::auth::{BrowserError, CallbackError, ExchangeError, StoreError};
use crate::config::ConfigError;

/// Fatal problems with the local environment. Never retried.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Configuration is missing or malformed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Redirect URI cannot be served by the loopback listener
    #[error("Invalid redirect URI: {0}")]
    InvalidRedirectUri(String),

    /// The fixed callback port is already bound
    #[error("Callback port {port} is unavailable")]
    PortUnavailable {
        /// Port from the registered redirect URI
        port: u16,
    },

    /// No browser could be launched
    #[error("Browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// The callback listener failed for a reason other than a busy port
    #[error("Callback listener failed: {0}")]
    Listener(String),
}

impl SetupError {
    /// Actionable guidance printed next to the error
    #[must_use]
    pub fn guidance(&self) -> String {
        match self {
            Self::InvalidConfig(_) => {
                "Set CLIENT_ID and REDIRECT_URI in the environment (see `cli-auth --help`)."
                    .to_string()
            }
            Self::InvalidRedirectUri(_) => "REDIRECT_URI must look like \
                 http://127.0.0.1:53682/callback and match the URI registered with the provider."
                .to_string(),
            Self::PortUnavailable { port } => format!(
                "Another process is listening on 127.0.0.1:{port}. Stop it (for example a \
                 stale login) and retry. The port cannot change because the redirect URI is \
                 registered with the provider."
            ),
            Self::BrowserUnavailable(_) => {
                "Install a browser, set BROWSER to its executable, or rerun with --no-browser \
                 and open the printed URL manually."
                    .to_string()
            }
            Self::Listener(_) => "Check that loopback networking is available.".to_string(),
        }
    }
}

/// Coarse classification of an [`AuthError`], used for retry decisions and
/// exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Local setup problem
    Setup,
    /// User closed the browser or denied consent
    UserCancelled,
    /// No callback before the deadline
    Timeout,
    /// Provider rejected the request
    Provider,
    /// Provider unreachable or failing with 5xx
    Network,
    /// Credential file unreadable
    CorruptState,
    /// Credentials could not be persisted
    Storage,
    /// A fresh login is required
    Unauthenticated,
    /// API call returned an error status
    Api,
}

/// Main error type for cli-auth
#[derive(Error, Debug)]
pub enum AuthError {
    /// Misconfiguration, busy port or missing browser
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// User closed the browser or denied consent
    #[error("Login cancelled: {0}")]
    UserCancelled(String),

    /// No callback arrived within the login deadline
    #[error(
        "Timed out after {}s waiting for the login callback\nSuggestion: run login again",
        .0.as_secs()
    )]
    Timeout(Duration),

    /// Provider rejected the code or refresh token (4xx)
    #[error("Login failed, please retry: {error}{}", describe(.description))]
    Provider {
        /// OAuth error code (for example `invalid_grant`)
        error: String,
        /// Human readable description from the provider
        description: Option<String>,
    },

    /// Provider unreachable or failing after bounded retries
    #[error("Network error: {0}")]
    Network(String),

    /// Credential file could not be parsed
    #[error("Corrupt credential state: {0}")]
    CorruptState(String),

    /// Credentials could not be persisted
    #[error("Failed to persist credentials: {0}")]
    Storage(String),

    /// No usable credentials; the user must run login again
    #[error("Not authenticated: {0}\nSuggestion: run `cli-auth login`")]
    Unauthenticated(String),

    /// API call returned a non-success status
    #[error("API request failed with HTTP {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Result type alias for cli-auth operations
pub type Result<T> = std::result::Result<T, AuthError>;

impl AuthError {
    /// Create a user-cancelled error
    pub fn user_cancelled(msg: impl Into<String>) -> Self {
        Self::UserCancelled(msg.into())
    }

    /// Create a provider error
    pub fn provider(error: impl Into<String>, description: Option<String>) -> Self {
        Self::Provider {
            error: error.into(),
            description,
        }
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an unauthenticated error
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Setup(_) => FailureKind::Setup,
            Self::UserCancelled(_) => FailureKind::UserCancelled,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Provider { .. } => FailureKind::Provider,
            Self::Network(_) => FailureKind::Network,
            Self::CorruptState(_) => FailureKind::CorruptState,
            Self::Storage(_) => FailureKind::Storage,
            Self::Unauthenticated(_) => FailureKind::Unauthenticated,
            Self::Api { .. } => FailureKind::Api,
        }
    }

    /// Whether re-running the same operation may succeed without user action
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::RedirectUri(msg) => SetupError::InvalidRedirectUri(msg).into(),
            other => SetupError::InvalidConfig(other.to_string()).into(),
        }
    }
}

impl From<CallbackError> for AuthError {
    fn from(err: CallbackError) -> Self {
        match err {
            CallbackError::PortUnavailable { port } => SetupError::PortUnavailable { port }.into(),
            CallbackError::Timeout(after) => Self::Timeout(after),
            CallbackError::Io(e) => SetupError::Listener(e.to_string()).into(),
        }
    }
}

impl From<BrowserError> for AuthError {
    fn from(err: BrowserError) -> Self {
        SetupError::BrowserUnavailable(err.to_string()).into()
    }
}

impl From<ExchangeError> for AuthError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Rejected {
                error, description, ..
            } => Self::Provider { error, description },
            ExchangeError::InvalidResponse(msg) => Self::provider("invalid_response", Some(msg)),
            ExchangeError::Transient { attempts, message } => {
                Self::Network(format!("{message} (after {attempts} attempts)"))
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(msg) => Self::CorruptState(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AuthError::Timeout(Duration::from_secs(2)).is_retryable());
        assert!(AuthError::network("connection reset").is_retryable());
        assert!(!AuthError::provider("invalid_grant", None).is_retryable());
        assert!(!AuthError::user_cancelled("closed").is_retryable());
    }

    #[test]
    fn test_port_unavailable_maps_to_setup() {
        let err: AuthError = CallbackError::PortUnavailable { port: 53682 }.into();
        assert_eq!(err.kind(), FailureKind::Setup);
        assert!(err.to_string().contains("53682"));
    }

    #[test]
    fn test_rejected_exchange_maps_to_provider() {
        let err: AuthError = ExchangeError::Rejected {
            status: 400,
            error: "invalid_grant".to_string(),
            description: Some("Invalid \"code\" in request.".to_string()),
        }
        .into();
        assert_eq!(err.kind(), FailureKind::Provider);
        assert!(err.to_string().contains("invalid_grant"));
        assert!(err.to_string().contains("please retry"));
    }

    #[test]
    fn test_transient_exchange_maps_to_network() {
        let err: AuthError = ExchangeError::Transient {
            attempts: 3,
            message: "HTTP 503".to_string(),
        }
        .into();
        assert_eq!(err.kind(), FailureKind::Network);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_setup_guidance_mentions_port() {
        let err = SetupError::PortUnavailable { port: 8765 };
        assert!(err.guidance().contains("127.0.0.1:8765"));
    }
}
