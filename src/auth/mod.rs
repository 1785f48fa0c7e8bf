//! OAuth 2.0 Authorization Code + PKCE building blocks
//!
//! # Overview
//!
//! A login runs through these pieces in order:
//!
//! 1. [`PkcePair`] and [`AuthorizationState`] are generated for the attempt
//! 2. [`CallbackListener`] binds the loopback redirect port
//! 3. A [`BrowserDriver`] shows the authorization URL to the user
//! 4. The provider redirects to the listener with a code
//! 5. [`TokenExchanger`] redeems code + verifier for a [`TokenSet`]
//! 6. [`CredentialStore`] persists the tokens
//!
//! [`LoginFlow`] wires these together; most programs go through
//! [`Session`](crate::Session) instead of using them directly.
//!
//! # Security
//!
//! - PKCE binds the code to this process; the verifier never leaves it
//!   except in the token request
//! - `state` is compared in constant time and mismatching callbacks are
//!   ignored
//! - Credentials are written atomically with user-only permissions (0600)
//! - Tokens are redacted in `Debug` output and logs

mod browser;
mod callback;
mod exchange;
mod login;
mod pkce;
mod token;

pub use browser::{
    BrowserDriver, BrowserError, BrowserKind, BrowserOutcome, ManualBrowser, SystemBrowser,
    launch_args,
};
pub use callback::{CallbackError, CallbackListener, CallbackResult};
pub use exchange::{DEFAULT_EXPIRES_IN, ExchangeError, TokenExchanger, http_client};
pub use login::{LoginFlow, LoginOutcome, LoginState, authorization_url};
pub use pkce::{AuthorizationState, CHALLENGE_METHOD, PkcePair, is_valid_verifier};
pub use token::{
    AccountProfile, CREDENTIAL_FILE_VERSION, CredentialFile, CredentialStore, StoreError,
    TokenSet, unix_now,
};
