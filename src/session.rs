//! Explicit authentication context
//!
//! A [`Session`] owns everything a command needs to authenticate: the
//! configuration, the credential store, the token exchanger, the shared HTTP
//! client and the browser driver. The program builds one at startup and
//! passes it to whatever needs it.

use std::sync::Arc;

use crate::auth::{
    AccountProfile, BrowserDriver, CredentialStore, LoginFlow, LoginOutcome, LoginState,
    SystemBrowser, TokenExchanger, TokenSet, http_client,
};
use crate::client::AuthenticatedClient;
use crate::config::AuthConfig;
use crate::error::{AuthError, Result, SetupError};

/// What `login` does when credentials are already stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoginMode {
    /// Reuse stored tokens that are still valid (refreshing them if needed)
    #[default]
    ReuseValid,
    /// Always run the browser flow
    Force,
}

/// Stored credential status, as reported by [`Session::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Nothing stored (or the stored file is unusable)
    LoggedOut,
    /// Stored tokens are valid
    Active {
        /// Unix timestamp the access token expires at
        expires_at: u64,
        /// Granted scopes
        scope: Option<String>,
        /// Account, if known
        account: Option<AccountProfile>,
    },
    /// Stored access token has expired
    Expired {
        /// Whether a refresh token is available
        refreshable: bool,
        /// Account, if known
        account: Option<AccountProfile>,
    },
}

/// Authentication context for one program run
#[derive(Clone)]
pub struct Session {
    config: Arc<AuthConfig>,
    http: reqwest::Client,
    exchanger: Arc<TokenExchanger>,
    store: Arc<CredentialStore>,
    browser: Arc<dyn BrowserDriver>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.config.client_id)
            .field("store", &self.store.path())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Session`]
#[derive(Default)]
pub struct SessionBuilder {
    config: Option<AuthConfig>,
    store: Option<CredentialStore>,
    browser: Option<Arc<dyn BrowserDriver>>,
    http: Option<reqwest::Client>,
}

impl SessionBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required)
    #[must_use]
    pub fn config(mut self, config: AuthConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a custom credential store
    #[must_use]
    pub fn store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the browser driver (default: [`SystemBrowser`])
    #[must_use]
    pub fn browser(mut self, browser: impl BrowserDriver + 'static) -> Self {
        self.browser = Some(Arc::new(browser));
        self
    }

    /// Share an existing HTTP client
    #[must_use]
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// Returns a setup error if the configuration is missing or invalid, or
    /// no credential location can be determined.
    pub fn build(self) -> Result<Session> {
        let config = self
            .config
            .ok_or_else(|| SetupError::InvalidConfig("no configuration given".to_string()))?;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => CredentialStore::new(&config)?,
        };
        let http = match self.http {
            Some(http) => http,
            None => http_client(config.request_timeout)
                .map_err(|e| SetupError::InvalidConfig(format!("HTTP client: {e}")))?,
        };
        let browser: Arc<dyn BrowserDriver> = match self.browser {
            Some(browser) => browser,
            None => match &config.browser {
                Some(path) => Arc::new(SystemBrowser::with_executable(path)),
                None => Arc::new(SystemBrowser::new()),
            },
        };

        tracing::debug!(store = %store.path().display(), "Session created");
        Ok(Session {
            exchanger: Arc::new(TokenExchanger::new(http.clone(), &config)),
            config: Arc::new(config),
            http,
            store: Arc::new(store),
            browser,
        })
    }
}

impl Session {
    /// Create a session with the default store and browser
    ///
    /// # Errors
    ///
    /// See [`SessionBuilder::build`].
    pub fn new(config: AuthConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The configuration
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The credential store
    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Log in
    ///
    /// With [`LoginMode::ReuseValid`], valid stored tokens are returned as
    /// they are and expired ones are refreshed; the browser only opens when
    /// neither works.
    ///
    /// # Errors
    ///
    /// Returns the reason the login failed.
    pub async fn login(&self, mode: LoginMode) -> Result<LoginOutcome> {
        if mode == LoginMode::ReuseValid {
            if let Some(outcome) = self.reuse_stored().await {
                return Ok(outcome);
            }
        }

        let mut flow = LoginFlow::new(
            &self.config,
            &self.http,
            &self.exchanger,
            &self.store,
            self.browser.clone(),
        );
        let result = flow.run().await;
        if let LoginState::Failed(kind) = flow.state() {
            tracing::debug!(?kind, "Login attempt failed");
        }
        result
    }

    async fn reuse_stored(&self) -> Option<LoginOutcome> {
        let file = self.store.load_file()?;
        if !file.tokens.expires_within(self.config.refresh_margin) {
            tracing::info!("Already logged in, reusing stored credentials");
            return Some(LoginOutcome {
                tokens: file.tokens,
                account: file.account,
            });
        }

        file.tokens.refresh_token.as_ref()?;
        let client = self.client_for(file.tokens);
        match client.access_token().await {
            Ok(tokens) => Some(LoginOutcome {
                tokens,
                account: file.account,
            }),
            Err(e) => {
                tracing::info!("Stored credentials could not be refreshed, logging in again: {e}");
                None
            }
        }
    }

    /// Delete stored credentials
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file exists but cannot be deleted.
    pub fn logout(&self) -> Result<bool> {
        let removed = self.store.clear()?;
        if removed {
            tracing::info!("Logged out");
        } else {
            tracing::debug!("Logout with no stored credentials");
        }
        Ok(removed)
    }

    /// Inspect stored credentials without touching the network
    #[must_use]
    pub fn status(&self) -> AuthStatus {
        match self.store.load_file() {
            None => AuthStatus::LoggedOut,
            Some(file) if file.tokens.is_expired() => AuthStatus::Expired {
                refreshable: file.tokens.refresh_token.is_some(),
                account: file.account,
            },
            Some(file) => AuthStatus::Active {
                expires_at: file.tokens.expires_at,
                scope: file.tokens.scope,
                account: file.account,
            },
        }
    }

    /// Client for the stored credentials
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] if nothing is stored.
    pub fn client(&self) -> Result<AuthenticatedClient> {
        let tokens = self
            .store
            .load()
            .ok_or_else(|| AuthError::unauthenticated("no stored credentials"))?;
        Ok(self.client_for(tokens))
    }

    /// Client for the stored credentials, logging in first when there are
    /// none or they cannot be refreshed
    ///
    /// # Errors
    ///
    /// Returns the login failure if a login was needed and failed.
    pub async fn ensure_client(&self, mode: LoginMode) -> Result<AuthenticatedClient> {
        let outcome = self.login(mode).await?;
        Ok(self.client_for(outcome.tokens))
    }

    fn client_for(&self, tokens: TokenSet) -> AuthenticatedClient {
        AuthenticatedClient::new(
            self.config.clone(),
            self.http.clone(),
            self.exchanger.clone(),
            self.store.clone(),
            tokens,
        )
    }
}
