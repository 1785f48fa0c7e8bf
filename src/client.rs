//! Authenticated API client
//!
//! [`AuthenticatedClient`] attaches the bearer token to every request and
//! keeps it fresh. The token state sits behind one async mutex; a caller
//! that finds the token due for refresh performs the refresh while holding
//! the lock, so concurrent callers wait and reuse the new token instead of
//! issuing their own refresh.
//!
//! # Example
//!
//! ```no_run
//! use cli_auth::{AuthConfig, Session};
//!
//! # async fn example() -> cli_auth::Result<()> {
//! let session = Session::new(AuthConfig::from_env()?)?;
//! let client = session.client()?;
//!
//! let me: serde_json::Value = client.get_json("users/@me").await?;
//! println!("{me}");
//! # Ok(())
//! # }
//! ```

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::{CredentialStore, ExchangeError, TokenExchanger, TokenSet};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::retry::{RetryPolicy, is_transient_error, is_transient_status};
use crate::utils::summarize_body;

/// Token state shared by all clones of a client
#[derive(Debug)]
enum TokenState {
    Active(TokenSet),
    /// Refresh failed for good; a new login is required
    Poisoned(String),
}

#[derive(Debug)]
struct ClientInner {
    config: Arc<AuthConfig>,
    http: reqwest::Client,
    exchanger: Arc<TokenExchanger>,
    store: Arc<CredentialStore>,
    tokens: Mutex<TokenState>,
}

/// HTTP client for the provider's API that refreshes its own token
///
/// Cloning is cheap and clones share the token state.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    inner: Arc<ClientInner>,
}

impl AuthenticatedClient {
    /// Create a client around `tokens`
    ///
    /// Usually obtained through [`Session::client`](crate::Session::client).
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        http: reqwest::Client,
        exchanger: Arc<TokenExchanger>,
        store: Arc<CredentialStore>,
        tokens: TokenSet,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                exchanger,
                store,
                tokens: Mutex::new(TokenState::Active(tokens)),
            }),
        }
    }

    /// Current access token, refreshed first if it expires within the
    /// configured margin
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] if the token cannot be
    /// refreshed, [`AuthError::Network`] if the provider is unreachable, or
    /// [`AuthError::Storage`] if refreshed tokens cannot be saved.
    pub async fn access_token(&self) -> Result<TokenSet> {
        let mut state = self.inner.tokens.lock().await;
        let current = match &*state {
            TokenState::Poisoned(reason) => return Err(AuthError::unauthenticated(reason.clone())),
            TokenState::Active(tokens) => tokens.clone(),
        };
        if !current.expires_within(self.inner.config.refresh_margin) {
            return Ok(current);
        }
        tracing::debug!("Access token due for refresh");
        self.refresh_locked(&mut state, &current).await
    }

    /// Refresh unless another caller already replaced `stale`
    async fn force_refresh(&self, stale: &TokenSet) -> Result<TokenSet> {
        let mut state = self.inner.tokens.lock().await;
        let current = match &*state {
            TokenState::Poisoned(reason) => return Err(AuthError::unauthenticated(reason.clone())),
            TokenState::Active(tokens) => tokens.clone(),
        };
        if current.access_token != stale.access_token {
            return Ok(current);
        }
        self.refresh_locked(&mut state, &current).await
    }

    /// Refresh with the state lock held
    async fn refresh_locked(&self, state: &mut TokenState, current: &TokenSet) -> Result<TokenSet> {
        let margin = self.inner.config.refresh_margin;

        // Another process may have refreshed already
        if let Some(stored) = self.inner.store.load() {
            if stored.access_token != current.access_token && !stored.expires_within(margin) {
                tracing::debug!("Adopting newer tokens from the credential store");
                *state = TokenState::Active(stored.clone());
                return Ok(stored);
            }
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            let reason = "access token expired and no refresh token is stored".to_string();
            *state = TokenState::Poisoned(reason.clone());
            return Err(AuthError::unauthenticated(reason));
        };

        match self.inner.exchanger.refresh(refresh_token).await {
            Ok(fresh) => {
                let fresh = fresh.inherit_from(current);
                // Fresh tokens are used only once they are on disk
                if let Err(e) = self.inner.store.save(&fresh) {
                    tracing::warn!("Refreshed tokens could not be persisted: {e}");
                    return Err(AuthError::storage(format!(
                        "refreshed tokens could not be saved: {e}"
                    )));
                }
                tracing::info!(expires_at = fresh.expires_at, "Access token refreshed");
                *state = TokenState::Active(fresh.clone());
                Ok(fresh)
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!("Refresh token rejected: {e}");
                let reason = match &e {
                    ExchangeError::Rejected { error, .. } => {
                        format!("the provider rejected the refresh token ({error})")
                    }
                    other => format!("token refresh failed: {other}"),
                };
                *state = TokenState::Poisoned(reason.clone());
                Err(AuthError::unauthenticated(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a request to `path` (relative to the API root, or absolute)
    ///
    /// `customize` adds headers, query or body; it may run more than once
    /// because 5xx responses and transport failures of safe methods are
    /// retried, and a `401` triggers one refresh and resend.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] if no valid token can be
    /// obtained and [`AuthError::Network`] if the API stays unreachable.
    /// Other error statuses are returned as the response.
    pub async fn send<F>(&self, method: Method, path: &str, customize: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let url = self.inner.config.endpoint(path)?;
        let mut tokens = self.access_token().await?;
        let mut refreshed = false;

        loop {
            let response = self
                .send_with_retry(&method, &url, &tokens, &customize)
                .await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if refreshed {
                return Err(AuthError::unauthenticated(
                    "the API rejected a freshly refreshed access token",
                ));
            }
            tracing::debug!(%url, "API returned 401, refreshing token");
            tokens = self.force_refresh(&tokens).await?;
            refreshed = true;
        }
    }

    async fn send_with_retry<F>(
        &self,
        method: &Method,
        url: &url::Url,
        tokens: &TokenSet,
        customize: &F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let policy = if method.is_safe() {
            self.inner.config.retry.clone()
        } else {
            RetryPolicy::none()
        };

        let mut attempt = 1;
        loop {
            let request = self
                .inner
                .http
                .request(method.clone(), url.clone())
                .header(reqwest::header::AUTHORIZATION, tokens.authorization_header());
            let failure = match customize(request).send().await {
                Ok(response) if is_transient_status(response.status()) => {
                    format!("API returned {}", response.status())
                }
                Ok(response) => return Ok(response),
                Err(e) if is_transient_error(&e) => format!("API unreachable: {e}"),
                Err(e) => return Err(AuthError::network(e.to_string())),
            };

            match policy.delay_after(attempt) {
                Some(delay) => {
                    tracing::warn!(attempt, %url, "{failure}, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    return Err(AuthError::network(format!(
                        "{failure} (after {attempt} attempts)"
                    )));
                }
            }
        }
    }

    /// GET `path` and decode the JSON body
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Api`] for non-success statuses, plus everything
    /// [`send`](Self::send) returns.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::GET, path, |r| r).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(AuthError::Api {
                status: status.as_u16(),
                body: summarize_body(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| AuthError::Api {
            status: status.as_u16(),
            body: format!("unexpected response body: {e}"),
        })
    }

    /// Whether a refresh failed for good and a new login is required
    pub async fn is_poisoned(&self) -> bool {
        matches!(*self.inner.tokens.lock().await, TokenState::Poisoned(_))
    }

    /// Remaining validity of the current access token, without refreshing
    pub async fn remaining_validity(&self) -> Option<Duration> {
        match &*self.inner.tokens.lock().await {
            TokenState::Active(tokens) => tokens.remaining_validity(),
            TokenState::Poisoned(_) => None,
        }
    }
}
