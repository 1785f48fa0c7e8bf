//! # cli-auth
//!
//! OAuth 2.0 Authorization Code + PKCE login for command-line tools.
//! Opens a browser, receives the redirect on a loopback listener, redeems the
//! code, persists the tokens and hands out an API client that keeps them
//! fresh. Async/await, strong typing, tokio-based.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cli_auth::{AuthConfig, LoginMode, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // CLIENT_ID and REDIRECT_URI come from the environment
//!     let session = Session::new(AuthConfig::from_env()?)?;
//!
//!     // Reuses stored credentials when they are still good
//!     let client = session.ensure_client(LoginMode::ReuseValid).await?;
//!
//!     let guilds: serde_json::Value = client.get_json("users/@me/guilds").await?;
//!     println!("{guilds:#}");
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`AuthConfig`] is either read from the environment (see [`config`] for the
//! variables) or built explicitly:
//!
//! ```
//! # use cli_auth::AuthConfig;
//! # use std::time::Duration;
//! let config = AuthConfig::builder()
//!     .client_id("1234567890")
//!     .redirect_uri("http://127.0.0.1:53682/callback")
//!     .scopes(vec!["identify".to_string()])
//!     .login_timeout(Duration::from_secs(60))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Architecture
//!
//! - [`auth`]: PKCE, callback listener, browser driver, token exchange,
//!   credential store and the login state machine
//! - [`session`]: The explicit context a program creates once and passes around
//! - [`client`]: API client with single-flight token refresh
//! - [`config`]: Configuration and validation
//! - [`retry`]: Backoff policy for transient failures
//! - [`error`]: Error types and handling
//!
//! ## Logging
//!
//! This crate uses [`tracing`](https://crates.io/crates/tracing) for structured logging.
//! Tracing events are always emitted but are zero-cost when no subscriber is attached.
//! Tokens never appear in events. To see logs, attach a subscriber:
//!
//! ```no_run
//! tracing_subscriber::fmt()
//!     .with_env_filter(tracing_subscriber::EnvFilter::new("cli_auth=debug"))
//!     .init();
//! ```
//!
//! ## Error Handling
//!
//! Everything a [`Session`] or [`AuthenticatedClient`] does returns
//! [`Result<T, AuthError>`](Result). [`AuthError::kind`] classifies failures
//! and [`AuthError::is_retryable`] tells whether trying again may help:
//!
//! ```no_run
//! # use cli_auth::{AuthError, LoginMode, Session};
//! # async fn example(session: Session) {
//! match session.login(LoginMode::Force).await {
//!     Ok(outcome) => println!("expires at {}", outcome.tokens.expires_at),
//!     Err(AuthError::Setup(e)) => eprintln!("{e}\n{}", e.guidance()),
//!     Err(e) if e.is_retryable() => eprintln!("{e} (try again)"),
//!     Err(e) => eprintln!("{e}"),
//! }
//! # }
//! ```
//!
//! ## Security
//!
//! - **PKCE (S256)** - Verifier from the OS-seeded CSPRNG, never logged
//! - **State check** - Callbacks with a missing or wrong `state` are ignored
//! - **Loopback only** - The listener binds `127.0.0.1` and closes after one callback
//! - **Private storage** - Credentials are written atomically with mode 0600
//! - **Isolated browser** - Dedicated browser instances use a throw-away profile

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod utils;

pub use auth::{
    AccountProfile, BrowserDriver, BrowserOutcome, CredentialStore, LoginOutcome, LoginState,
    ManualBrowser, SystemBrowser, TokenSet,
};
pub use client::AuthenticatedClient;
pub use config::{AuthConfig, TokenRequestFormat};
pub use error::{AuthError, FailureKind, Result, SetupError};
pub use retry::RetryPolicy;
pub use session::{AuthStatus, LoginMode, Session, SessionBuilder};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
