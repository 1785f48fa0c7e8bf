//! Token Set and credential persistence

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::utils::redact;

/// Credential file schema version
pub const CREDENTIAL_FILE_VERSION: u32 = 1;

/// Directory name under the per-OS config directory
const APP_DIR: &str = "cli-auth";

/// File name of the persisted credentials
const CREDENTIAL_FILE: &str = "credentials.json";

/// Errors that can occur during credential storage
#[derive(Debug, Error)]
pub enum StoreError {
    /// No per-user location could be determined
    #[error("No per-user configuration directory available")]
    NoConfigDir,

    /// File exists but cannot be used
    #[error("Credential file is unusable: {0}")]
    Corrupt(String),

    /// I/O error during storage operations
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current unix time in seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Access/refresh token pair with absolute expiry
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token for API calls
    pub access_token: String,

    /// Refresh token for obtaining new access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Unix timestamp when the access token expires
    pub expires_at: u64,

    /// Scopes granted to this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenSet {
    /// Build a token set from a token endpoint response received at
    /// `issued_at`
    #[must_use]
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        token_type: Option<String>,
        issued_at: u64,
        expires_in: u64,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_token_type),
            expires_at: issued_at.saturating_add(expires_in),
            scope,
        }
    }

    /// Whether `now >= expires_at - margin`
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        unix_now() + margin.as_secs() >= self.expires_at
    }

    /// Whether the access token has already expired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }

    /// Get the Authorization header value
    ///
    /// The scheme is always sent as `Bearer`, whatever casing the provider
    /// used in `token_type`.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Get remaining validity duration, if any
    #[must_use]
    pub fn remaining_validity(&self) -> Option<Duration> {
        let now = unix_now();
        (self.expires_at > now).then(|| Duration::from_secs(self.expires_at - now))
    }

    /// Fill fields the provider omitted on refresh from the previous set
    #[must_use]
    pub fn inherit_from(mut self, previous: &TokenSet) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token.clone_from(&previous.refresh_token);
        }
        if self.scope.is_none() {
            self.scope.clone_from(&previous.scope);
        }
        self
    }
}

/// Account the tokens belong to, as reported by the profile endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Provider user id
    pub id: String,
    /// Login name
    pub username: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_name: Option<String>,
    /// Avatar hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl AccountProfile {
    /// Name to greet the user with
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

/// On-disk representation of the credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFile {
    /// Schema version
    pub version: u32,
    /// Client id the tokens were issued to
    pub client_id: String,
    /// Redirect URI used at login
    pub redirect_uri: String,
    /// Scopes requested at login
    pub scopes: Vec<String>,
    /// Unix timestamp of the last write
    pub saved_at: u64,
    /// The tokens
    pub tokens: TokenSet,
    /// Account the tokens belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountProfile>,
}

/// Credential storage for one client configuration
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    client_id: String,
    redirect_uri: String,
    scopes: Vec<String>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a store for `config`, at `config.credentials_path` or the
    /// default per-user location
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoConfigDir`] if no per-user directory exists.
    pub fn new(config: &AuthConfig) -> Result<Self, StoreError> {
        let path = match &config.credentials_path {
            Some(path) => path.clone(),
            None => Self::default_path().ok_or(StoreError::NoConfigDir)?,
        };
        Ok(Self::with_path(path, config))
    }

    /// Create a store at a custom path
    #[must_use]
    pub fn with_path(path: PathBuf, config: &AuthConfig) -> Self {
        Self {
            path,
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default credential path (platform-specific config directory, never
    /// the working directory)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .or_else(|| dirs::home_dir().map(|home| home.join(format!(".{APP_DIR}"))))
            .map(|dir| dir.join(CREDENTIAL_FILE))
    }

    /// Get the storage path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the tokens, treating any unusable file as absent
    #[must_use]
    pub fn load(&self) -> Option<TokenSet> {
        self.load_file().map(|file| file.tokens)
    }

    /// Load the full credential file, treating any unusable file as absent
    #[must_use]
    pub fn load_file(&self) -> Option<CredentialFile> {
        match self.read_checked() {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring stored credentials: {e}");
                None
            }
        }
    }

    /// Load and validate the credential file
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] for unparseable or incompatible files
    /// and I/O errors for unreadable ones. A missing file is `Ok(None)`.
    pub fn read_checked(&self) -> Result<Option<CredentialFile>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CredentialFile = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("unparseable JSON: {e}")))?;

        if file.version != CREDENTIAL_FILE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported version {}",
                file.version
            )));
        }
        if file.client_id != self.client_id {
            return Err(StoreError::Corrupt(format!(
                "issued to client {}, configured client is {}",
                file.client_id, self.client_id
            )));
        }
        if file.tokens.access_token.is_empty() {
            return Err(StoreError::Corrupt("empty access token".to_string()));
        }

        Ok(Some(file))
    }

    /// Replace the stored tokens, keeping a previously stored account profile
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let account = self.load_file().and_then(|file| file.account);
        self.write_file(tokens, account)
    }

    /// Replace the stored tokens and account profile
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_login(
        &self,
        tokens: &TokenSet,
        account: Option<AccountProfile>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        self.write_file(tokens, account)
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Caller holds the write lock
    fn write_file(
        &self,
        tokens: &TokenSet,
        account: Option<AccountProfile>,
    ) -> Result<(), StoreError> {
        let file = CredentialFile {
            version: CREDENTIAL_FILE_VERSION,
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
            saved_at: unix_now(),
            tokens: tokens.clone(),
            account,
        };
        let content = serde_json::to_string_pretty(&file)?;
        self.write_atomic(content.as_bytes())?;

        tracing::debug!(path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    /// Write to a temporary file next to the target and rename it over the
    /// target, so readers only ever see a complete file
    fn write_atomic(&self, content: &[u8]) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        create_private_dir(parent)?;

        // NamedTempFile is created with 0600 on Unix
        let mut tmp = tempfile::Builder::new()
            .prefix(".credentials")
            .suffix(".tmp")
            .tempfile_in(parent)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Delete stored credentials
    ///
    /// Returns whether a file was removed; clearing an empty store is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be deleted.
    pub fn clear(&self) -> Result<bool, StoreError> {
        let _guard = self.lock_writes();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Credentials cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(client_id: &str) -> AuthConfig {
        AuthConfig::builder()
            .client_id(client_id)
            .redirect_uri("http://127.0.0.1:53682/callback")
            .build()
    }

    fn tokens(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet::new(
            access.to_string(),
            refresh.map(str::to_string),
            Some("Bearer".to_string()),
            unix_now(),
            604_800,
            Some("identify guilds".to_string()),
        )
    }

    #[test]
    fn test_token_set_new() {
        let token = TokenSet::new("access123".to_string(), None, None, 1_000, 3600, None);
        assert_eq!(token.expires_at, 4_600);
        assert_eq!(token.token_type, "Bearer");
        assert!(token.is_expired());
    }

    #[test]
    fn test_expires_within_margin() {
        let token = TokenSet::new("a".to_string(), None, None, unix_now(), 30, None);
        assert!(!token.is_expired());
        assert!(token.expires_within(Duration::from_secs(60)));
        assert!(token.remaining_validity().is_some());
    }

    #[test]
    fn test_authorization_header() {
        let mut token = tokens("access123", None);
        token.token_type = "bearer".to_string();
        assert_eq!(token.authorization_header(), "Bearer access123");
    }

    #[test]
    fn test_inherit_from_previous() {
        let previous = tokens("old", Some("refresh-old"));
        let fresh = TokenSet::new("new".to_string(), None, None, unix_now(), 60, None);
        let merged = fresh.inherit_from(&previous);
        assert_eq!(merged.access_token, "new");
        assert_eq!(merged.refresh_token.as_deref(), Some("refresh-old"));
        assert_eq!(merged.scope.as_deref(), Some("identify guilds"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let token = tokens("supersecretaccesstoken", Some("supersecretrefreshtoken"));
        let debug = format!("{token:?}");
        assert!(!debug.contains("supersecretaccesstoken"));
        assert!(!debug.contains("supersecretrefreshtoken"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("creds.json"), &config("A"));

        let token = tokens("test_access", Some("test_refresh"));
        store.save(&token).unwrap();

        assert_eq!(store.load(), Some(token));
        let file = store.load_file().unwrap();
        assert_eq!(file.client_id, "A");
        assert_eq!(file.redirect_uri, "http://127.0.0.1:53682/callback");
        assert_eq!(file.scopes, vec!["identify", "guilds"]);
    }

    #[test]
    fn test_save_creates_nested_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("creds.json");
        let store = CredentialStore::with_path(path.clone(), &config("A"));
        store.save(&tokens("x", None)).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("creds.json"), &config("A"));
        store.save(&tokens("x", None)).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("creds.json"), &config("A"));
        store.save(&tokens("one", None)).unwrap();
        store.save(&tokens("two", None)).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.load().unwrap().access_token, "two");
    }

    #[test]
    fn test_save_keeps_account() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("creds.json"), &config("A"));
        let account = AccountProfile {
            id: "80351110224678912".to_string(),
            username: "nelly".to_string(),
            global_name: Some("Nelly".to_string()),
            avatar: None,
        };
        store
            .save_login(&tokens("first", Some("r")), Some(account.clone()))
            .unwrap();
        store.save(&tokens("second", Some("r"))).unwrap();

        let file = store.load_file().unwrap();
        assert_eq!(file.tokens.access_token, "second");
        assert_eq!(file.account, Some(account));
    }

    #[test]
    fn test_concurrent_save_does_not_drop_account() {
        let temp_dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(CredentialStore::with_path(
            temp_dir.path().join("creds.json"),
            &config("A"),
        ));
        store.save(&tokens("initial", Some("r"))).unwrap();
        let account = AccountProfile {
            id: "1".to_string(),
            username: "nelly".to_string(),
            global_name: None,
            avatar: None,
        };

        let refresher = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store.save(&tokens(&format!("refresh-{i}"), Some("r"))).unwrap();
                }
            })
        };
        let login = {
            let store = store.clone();
            let account = account.clone();
            std::thread::spawn(move || {
                store
                    .save_login(&tokens("login", Some("r")), Some(account))
                    .unwrap();
            })
        };
        refresher.join().unwrap();
        login.join().unwrap();

        assert_eq!(store.load_file().unwrap().account, Some(account));
    }

    #[test]
    fn test_load_missing_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("none.json"), &config("A"));
        assert!(store.load().is_none());
        assert!(matches!(store.read_checked(), Ok(None)));
    }

    #[test]
    fn test_corrupt_file_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = CredentialStore::with_path(path, &config("A"));

        assert!(store.load().is_none());
        assert!(matches!(store.read_checked(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_client_id_mismatch_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds.json");
        CredentialStore::with_path(path.clone(), &config("A"))
            .save(&tokens("x", None))
            .unwrap();

        let store_b = CredentialStore::with_path(path, &config("B"));
        assert!(store_b.load().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::with_path(temp_dir.path().join("creds.json"), &config("A"));
        store.save(&tokens("x", None)).unwrap();

        assert!(store.clear().unwrap());
        assert!(store.load().is_none());
        assert!(!store.clear().unwrap());
    }
}
