//! Login orchestration
//!
//! Drives one Authorization Code + PKCE attempt:
//!
//! ```text
//! Idle -> AwaitingCallback -> Exchanging -> Authenticated
//!              |                  |
//!              +------------------+--> Failed(kind)
//! ```
//!
//! The callback listener is bound before anything is shown to the user so a
//! busy port fails fast. The browser runs in its own task; whichever of
//! {callback, browser end} comes first decides the outcome, and the other
//! side is cancelled and awaited before the flow moves on.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::browser::{BrowserDriver, BrowserError, BrowserOutcome};
use super::callback::{CallbackListener, CallbackResult};
use super::exchange::TokenExchanger;
use super::pkce::{AuthorizationState, PkcePair};
use super::token::{AccountProfile, CredentialStore, TokenSet};
use crate::config::{AuthConfig, ConfigError, LoopbackRedirect};
use crate::error::{AuthError, FailureKind, Result};

/// OAuth error the provider sends when the user declines consent
const ACCESS_DENIED: &str = "access_denied";

/// Observable state of a [`LoginFlow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Nothing started yet
    Idle,
    /// Listener bound, browser open, waiting for the redirect
    AwaitingCallback,
    /// Redeeming the authorization code
    Exchanging,
    /// Tokens obtained and persisted
    Authenticated,
    /// Attempt ended without tokens
    Failed(FailureKind),
}

impl LoginState {
    /// Whether the flow can no longer change state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed(_))
    }
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Tokens as persisted
    pub tokens: TokenSet,
    /// Account reported by the profile endpoint, if it answered
    pub account: Option<AccountProfile>,
}

/// One login attempt
///
/// A flow is single-use: after [`run`](Self::run) returns, [`state`](Self::state)
/// reports how it ended.
pub struct LoginFlow<'a> {
    config: &'a AuthConfig,
    http: &'a reqwest::Client,
    exchanger: &'a TokenExchanger,
    store: &'a CredentialStore,
    browser: Arc<dyn BrowserDriver>,
    state: LoginState,
}

impl std::fmt::Debug for LoginFlow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginFlow")
            .field("state", &self.state)
            .field("store", &self.store.path())
            .finish_non_exhaustive()
    }
}

impl<'a> LoginFlow<'a> {
    /// Prepare a flow; nothing happens until [`run`](Self::run)
    #[must_use]
    pub fn new(
        config: &'a AuthConfig,
        http: &'a reqwest::Client,
        exchanger: &'a TokenExchanger,
        store: &'a CredentialStore,
        browser: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self {
            config,
            http,
            exchanger,
            store,
            browser,
            state: LoginState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Run the attempt to completion
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed; [`state`](Self::state) is then
    /// `Failed` with the matching kind.
    pub async fn run(&mut self) -> Result<LoginOutcome> {
        if self.state != LoginState::Idle {
            return Err(crate::error::SetupError::InvalidConfig(
                "a login flow can only be run once".to_string(),
            )
            .into());
        }

        let result = self.drive().await;
        match &result {
            Ok(_) => self.transition(LoginState::Authenticated),
            Err(e) => self.transition(LoginState::Failed(e.kind())),
        }
        result
    }

    fn transition(&mut self, next: LoginState) {
        tracing::debug!(from = ?self.state, to = ?next, "Login state change");
        self.state = next;
    }

    async fn drive(&mut self) -> Result<LoginOutcome> {
        let redirect = self.config.loopback_redirect()?;
        let pkce = PkcePair::generate();
        let state = AuthorizationState::generate();

        let listener = CallbackListener::bind(redirect.port, redirect.path.clone(), state.clone())
            .await?;
        let url = authorization_url(self.config, &redirect, &pkce, &state)?;
        self.transition(LoginState::AwaitingCallback);

        tracing::info!(redirect_uri = %redirect.uri, "Waiting for login callback");
        let code = match self.await_callback(listener, url.to_string()).await? {
            CallbackResult::Code { code } => code,
            CallbackResult::Denied { error, description } if error == ACCESS_DENIED => {
                return Err(AuthError::user_cancelled(
                    description.unwrap_or_else(|| "consent was denied".to_string()),
                ));
            }
            CallbackResult::Denied { error, description } => {
                return Err(AuthError::provider(error, description));
            }
        };

        self.transition(LoginState::Exchanging);
        let tokens = self
            .exchanger
            .exchange_code(&code, &pkce.verifier, &redirect.uri)
            .await?;

        let account = self.fetch_profile(&tokens).await;

        self.store.save_login(&tokens, account.clone())?;
        match &account {
            Some(account) => tracing::info!(user = %account.display_name(), "Logged in"),
            None => tracing::info!("Logged in"),
        }

        Ok(LoginOutcome { tokens, account })
    }

    /// Race the callback listener against the browser session
    async fn await_callback(
        &self,
        listener: CallbackListener,
        url: String,
    ) -> Result<CallbackResult> {
        let timeout = self.config.login_timeout;
        let cancel = CancellationToken::new();
        // Closes the browser if this future is dropped mid-flight
        let _guard = cancel.clone().drop_guard();

        let mut browser = spawn_browser(self.browser.clone(), url, timeout, cancel.clone());
        let mut browser_done = false;
        let callback = listener.wait_for_result(timeout);
        tokio::pin!(callback);

        let result = loop {
            tokio::select! {
                biased;
                received = &mut callback => break received.map_err(AuthError::from),
                joined = &mut browser, if !browser_done => {
                    browser_done = true;
                    match flatten(joined) {
                        Ok(BrowserOutcome::Abandoned) => {
                            tracing::info!("Browser closed before login completed");
                            break Err(AuthError::user_cancelled(
                                "the browser was closed before login completed",
                            ));
                        }
                        Ok(BrowserOutcome::Completed | BrowserOutcome::TimedOut) => {
                            // The redirect may still arrive before the deadline
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        cancel.cancel();
        if !browser_done {
            match flatten(browser.await) {
                Ok(outcome) => tracing::debug!(?outcome, "Browser session closed"),
                Err(e) => tracing::warn!("Browser driver failed while closing: {e}"),
            }
        }
        result
    }

    async fn fetch_profile(&self, tokens: &TokenSet) -> Option<AccountProfile> {
        let path = self.config.profile_path.as_deref()?;
        let url = match self.config.endpoint(path) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Skipping profile lookup: {e}");
                return None;
            }
        };

        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, tokens.authorization_header())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let profile = match response {
            Ok(response) => response.json::<AccountProfile>().await,
            Err(e) => Err(e),
        };
        match profile {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!("Profile lookup failed, continuing without it: {e}");
                None
            }
        }
    }
}

fn spawn_browser(
    browser: Arc<dyn BrowserDriver>,
    url: String,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<std::result::Result<BrowserOutcome, BrowserError>> {
    tokio::spawn(async move { browser.authorize(&url, timeout, cancel).await })
}

fn flatten(
    joined: std::result::Result<
        std::result::Result<BrowserOutcome, BrowserError>,
        tokio::task::JoinError,
    >,
) -> std::result::Result<BrowserOutcome, BrowserError> {
    joined.unwrap_or_else(|e| Err(BrowserError::Unavailable(format!("browser task failed: {e}"))))
}

/// Build the authorization URL for one attempt
///
/// # Errors
///
/// Returns an error if the configured authorization endpoint is not a URL.
pub fn authorization_url(
    config: &AuthConfig,
    redirect: &LoopbackRedirect,
    pkce: &PkcePair,
    state: &AuthorizationState,
) -> std::result::Result<Url, ConfigError> {
    let mut url = Url::parse(&config.authorize_url).map_err(|_| ConfigError::InvalidUrl {
        name: "AUTHORIZE_URL",
        value: config.authorize_url.clone(),
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &redirect.uri)
            .append_pair("scope", &config.scope_string())
            .append_pair("state", state.as_str())
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", pkce.method);
        for (key, value) in &config.extra_authorize_params {
            query.append_pair(key, value);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> AuthConfig {
        AuthConfig::builder()
            .client_id("1234")
            .redirect_uri("http://127.0.0.1:53682/callback")
            .extra_authorize_params(vec![("prompt".to_string(), "consent".to_string())])
            .build()
    }

    #[test]
    fn test_authorization_url_parameters() {
        let config = config();
        let redirect = config.loopback_redirect().unwrap();
        let pkce = PkcePair::generate();
        let state = AuthorizationState::generate();

        let url = authorization_url(&config, &redirect, &pkce, &state).unwrap();
        assert!(url.as_str().starts_with("https://discord.com/oauth2/authorize?"));

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "1234");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:53682/callback");
        assert_eq!(params["scope"], "identify guilds");
        assert_eq!(params["state"], state.as_str());
        assert_eq!(params["code_challenge"], pkce.challenge);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["prompt"], "consent");
        assert!(!params.contains_key("code_verifier"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!LoginState::Idle.is_terminal());
        assert!(!LoginState::AwaitingCallback.is_terminal());
        assert!(LoginState::Authenticated.is_terminal());
        assert!(LoginState::Failed(FailureKind::Timeout).is_terminal());
    }
}
