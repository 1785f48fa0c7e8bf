//! Token endpoint client
//!
//! Redeems authorization codes and refresh tokens. Provider rejections
//! (4xx) are final; server errors and transport failures are retried under
//! the configured [`RetryPolicy`].

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use super::token::{TokenSet, unix_now};
use crate::config::{AuthConfig, TokenRequestFormat};
use crate::retry::{RetryPolicy, is_transient_error, is_transient_status};
use crate::utils::summarize_body;

/// Lifetime assumed when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Errors from the token endpoint
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Provider refused the grant (`invalid_grant`, `invalid_client`, ...)
    #[error("token endpoint rejected the request ({status}): {error}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// OAuth error code, or `http_<status>` if the body had none
        error: String,
        /// Optional `error_description`
        description: Option<String>,
    },

    /// Success status but the body is not a usable token response
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// Server errors or transport failures outlasted the retry budget
    #[error("{message} (after {attempts} attempts)")]
    Transient {
        /// Attempts made
        attempts: u32,
        /// Last failure
        message: String,
    },
}

impl ExchangeError {
    /// Whether the grant itself was refused (as opposed to being unreachable)
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::InvalidResponse(_))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self, issued_at: u64) -> Result<TokenSet, ExchangeError> {
        if self.access_token.is_empty() {
            return Err(ExchangeError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }
        let expires_in = self.expires_in.unwrap_or_else(|| {
            tracing::debug!("Token response has no expires_in, assuming {DEFAULT_EXPIRES_IN}s");
            DEFAULT_EXPIRES_IN
        });
        Ok(TokenSet::new(
            self.access_token,
            self.refresh_token.filter(|t| !t.is_empty()),
            self.token_type,
            issued_at,
            expires_in,
            self.scope,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Why a single attempt failed
enum AttemptError {
    Retryable(String),
    Final(ExchangeError),
}

/// Client for the token endpoint
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    format: TokenRequestFormat,
    retry: RetryPolicy,
}

impl TokenExchanger {
    /// Create an exchanger for `config`, sharing `http`
    #[must_use]
    pub fn new(http: reqwest::Client, config: &AuthConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            format: config.token_request_format,
            retry: config.retry.clone(),
        }
    }

    /// Redeem an authorization code
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Rejected`] if the provider refuses the code.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, ExchangeError> {
        tracing::debug!("Exchanging authorization code");
        self.request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", verifier),
        ])
        .await
    }

    /// Redeem a refresh token
    ///
    /// The returned set carries only what the provider sent; callers merge
    /// with [`TokenSet::inherit_from`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Rejected`] if the refresh token is no longer
    /// accepted.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ExchangeError> {
        tracing::debug!("Refreshing access token");
        self.request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }

    async fn request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ExchangeError> {
        let mut attempt = 1;
        loop {
            match self.attempt(params).await {
                Ok(tokens) => return Ok(tokens),
                Err(AttemptError::Final(e)) => return Err(e),
                Err(AttemptError::Retryable(message)) => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Token request failed, retrying: {message}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(ExchangeError::Transient {
                            attempts: attempt,
                            message,
                        });
                    }
                },
            }
        }
    }

    async fn attempt(&self, params: &[(&str, &str)]) -> Result<TokenSet, AttemptError> {
        let builder = self
            .http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json");
        let builder = match self.format {
            TokenRequestFormat::Form => builder.form(params),
            TokenRequestFormat::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
                    .collect();
                builder.json(&body)
            }
        };

        let issued_at = unix_now();
        let response = builder.send().await.map_err(|e| {
            if is_transient_error(&e) {
                AttemptError::Retryable(format!("token endpoint unreachable: {e}"))
            } else {
                AttemptError::Final(ExchangeError::Transient {
                    attempts: 1,
                    message: format!("token request failed: {e}"),
                })
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptError::Retryable(format!("failed to read token response: {e}")))?;

        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
                AttemptError::Final(ExchangeError::InvalidResponse(format!(
                    "{e}: {}",
                    summarize_body(&body)
                )))
            })?;
            return parsed.into_token_set(issued_at).map_err(AttemptError::Final);
        }

        if is_transient_status(status) {
            return Err(AttemptError::Retryable(format!(
                "token endpoint returned {status}: {}",
                summarize_body(&body)
            )));
        }

        let (error, description) = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => (parsed.error, parsed.error_description),
            Err(_) => (
                format!("http_{}", status.as_u16()),
                Some(summarize_body(&body)).filter(|b| !b.is_empty()),
            ),
        };
        tracing::debug!(status = status.as_u16(), %error, "Token endpoint rejected request");
        Err(AttemptError::Final(ExchangeError::Rejected {
            status: status.as_u16(),
            error,
            description,
        }))
    }
}

/// Build the shared HTTP client
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn http_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("cli-auth/", env!("CARGO_PKG_VERSION")))
        .build()
}
