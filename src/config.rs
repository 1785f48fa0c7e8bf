//! Configuration for the login flow and the API client
//!
//! [`AuthConfig`] is built once per process, either through its builder or
//! from the environment with [`AuthConfig::from_env`], and is treated as
//! immutable afterwards.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `CLIENT_ID` | OAuth client id | required |
//! | `REDIRECT_URI` | Registered loopback redirect | required |
//! | `ROOT` | API root | `https://discord.com/api/` |
//! | `AUTHORIZE_URL` | Authorization endpoint | `https://discord.com/oauth2/authorize` |
//! | `TOKEN_URL` | Token endpoint | `{ROOT}oauth2/token` |
//! | `SCOPES` | Space separated scopes | `identify guilds` |
//! | `LOGIN_TIMEOUT_SECS` | Login deadline | `120` |
//! | `BROWSER` | Browser executable | auto-detected |
//! | `CLI_AUTH_CREDENTIALS` | Credential file path | per-OS config dir |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use typed_builder::TypedBuilder;
use url::Url;

use crate::retry::RetryPolicy;

/// Default API root
pub const DEFAULT_API_ROOT: &str = "https://discord.com/api/";
/// Default authorization endpoint
pub const DEFAULT_AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
/// Default token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
/// Default scopes
pub const DEFAULT_SCOPES: &[&str] = &["identify", "guilds"];
/// Default login deadline
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(120);
/// Default refresh safety margin
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Default per-request HTTP timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default profile lookup path, relative to the API root
pub const DEFAULT_PROFILE_PATH: &str = "users/@me";

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required variable is not set
    #[error("{0} is not set")]
    Missing(&'static str),

    /// Redirect URI is unusable for a loopback listener
    #[error("{0}")]
    RedirectUri(String),

    /// An endpoint is not an absolute http(s) URL
    #[error("{name} is not a valid http(s) URL: {value}")]
    InvalidUrl {
        /// Setting name
        name: &'static str,
        /// Offending value
        value: String,
    },

    /// A numeric or enumerated setting could not be parsed
    #[error("{name} has an invalid value: {value}")]
    InvalidValue {
        /// Setting name
        name: &'static str,
        /// Offending value
        value: String,
    },
}

/// Encoding of token endpoint request bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenRequestFormat {
    /// `application/x-www-form-urlencoded` (RFC 6749)
    #[default]
    Form,
    /// `application/json`
    Json,
}

/// Loopback address the callback listener serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackRedirect {
    /// Full redirect URI as registered with the provider
    pub uri: String,
    /// Fixed port
    pub port: u16,
    /// Path the provider redirects to, always starting with `/`
    pub path: String,
}

/// Authentication configuration
#[derive(Debug, Clone, TypedBuilder)]
#[builder(
    builder_method(doc = "Create a new builder for AuthConfig"),
    builder_type(doc = "Builder for AuthConfig", vis = "pub"),
    build_method(doc = "Build the AuthConfig")
)]
pub struct AuthConfig {
    /// OAuth client id
    #[builder(setter(into))]
    pub client_id: String,

    /// Redirect URI registered with the provider (loopback, fixed port)
    #[builder(setter(into))]
    pub redirect_uri: String,

    /// Authorization endpoint
    #[builder(default = DEFAULT_AUTHORIZE_URL.to_string(), setter(into))]
    pub authorize_url: String,

    /// Token endpoint
    #[builder(default = DEFAULT_TOKEN_URL.to_string(), setter(into))]
    pub token_url: String,

    /// Root of the REST API the authenticated client talks to
    #[builder(default = DEFAULT_API_ROOT.to_string(), setter(into))]
    pub api_root: String,

    /// Scopes to request
    #[builder(default = DEFAULT_SCOPES.iter().map(ToString::to_string).collect())]
    pub scopes: Vec<String>,

    /// Extra authorization query parameters (for example `prompt=consent`)
    #[builder(default)]
    pub extra_authorize_params: Vec<(String, String)>,

    /// Token request body encoding
    #[builder(default)]
    pub token_request_format: TokenRequestFormat,

    /// Overall deadline for one login attempt
    #[builder(default = DEFAULT_LOGIN_TIMEOUT)]
    pub login_timeout: Duration,

    /// Refresh this long before `expires_at`
    #[builder(default = DEFAULT_REFRESH_MARGIN)]
    pub refresh_margin: Duration,

    /// Per-request HTTP timeout
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,

    /// Retry policy for transient failures
    #[builder(default)]
    pub retry: RetryPolicy,

    /// Credential file override
    #[builder(default, setter(strip_option, into))]
    pub credentials_path: Option<PathBuf>,

    /// Browser executable override
    #[builder(default, setter(strip_option, into))]
    pub browser: Option<PathBuf>,

    /// Profile endpoint fetched after login, relative to `api_root`
    #[builder(default = Some(DEFAULT_PROFILE_PATH.to_string()), setter(into))]
    pub profile_path: Option<String>,
}

impl AuthConfig {
    /// Load configuration from process environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let client_id = get("CLIENT_ID").ok_or(ConfigError::Missing("CLIENT_ID"))?;
        let redirect_uri = get("REDIRECT_URI").ok_or(ConfigError::Missing("REDIRECT_URI"))?;

        let api_root = get("ROOT").unwrap_or_else(|| DEFAULT_API_ROOT.to_string());
        let api_root = with_trailing_slash(&api_root);
        let token_url = get("TOKEN_URL").unwrap_or_else(|| format!("{api_root}oauth2/token"));
        let authorize_url =
            get("AUTHORIZE_URL").unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string());

        let scopes = get("SCOPES").map_or_else(
            || DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            |s| s.split([' ', ',']).filter(|s| !s.is_empty()).map(str::to_string).collect(),
        );

        let login_timeout = match get("LOGIN_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidValue {
                    name: "LOGIN_TIMEOUT_SECS",
                    value: raw,
                })?,
            None => DEFAULT_LOGIN_TIMEOUT,
        };

        let config = Self {
            client_id,
            redirect_uri,
            authorize_url,
            token_url,
            api_root,
            scopes,
            extra_authorize_params: Vec::new(),
            token_request_format: TokenRequestFormat::default(),
            login_timeout,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            credentials_path: get("CLI_AUTH_CREDENTIALS").map(PathBuf::from),
            browser: get("BROWSER").map(PathBuf::from),
            profile_path: Some(DEFAULT_PROFILE_PATH.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a login
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("CLIENT_ID"));
        }
        self.loopback_redirect()?;
        parse_http_url("AUTHORIZE_URL", &self.authorize_url)?;
        parse_http_url("TOKEN_URL", &self.token_url)?;
        parse_http_url("ROOT", &self.api_root)?;
        Ok(())
    }

    /// Decompose the redirect URI into the listener's port and path
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RedirectUri`] unless the URI is
    /// `http://<loopback>:<port>/<path>`.
    pub fn loopback_redirect(&self) -> Result<LoopbackRedirect, ConfigError> {
        let url = Url::parse(&self.redirect_uri).map_err(|e| {
            ConfigError::RedirectUri(format!("cannot parse {}: {e}", self.redirect_uri))
        })?;

        if url.scheme() != "http" {
            return Err(ConfigError::RedirectUri(format!(
                "{} must use http:// (the loopback listener does not terminate TLS)",
                self.redirect_uri
            )));
        }

        // The listener binds 127.0.0.1 only
        let loopback = match url.host() {
            Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
            Some(url::Host::Ipv6(_)) | None => false,
        };
        if !loopback {
            return Err(ConfigError::RedirectUri(format!(
                "{} must point at 127.0.0.1 or localhost",
                self.redirect_uri
            )));
        }

        let port = url.port().ok_or_else(|| {
            ConfigError::RedirectUri(format!(
                "{} must name an explicit port",
                self.redirect_uri
            ))
        })?;

        let path = url.path().to_string();
        if path.is_empty() || path == "/" {
            return Err(ConfigError::RedirectUri(format!(
                "{} must include a callback path such as /callback",
                self.redirect_uri
            )));
        }

        Ok(LoopbackRedirect {
            uri: self.redirect_uri.clone(),
            port,
            path,
        })
    }

    /// Scopes joined the way the authorization endpoint expects them
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Resolve an API path against the API root
    ///
    /// # Errors
    ///
    /// Returns an error if the root or the joined URL is malformed.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return parse_http_url("path", path);
        }
        let root = parse_http_url("ROOT", &with_trailing_slash(&self.api_root))?;
        root.join(path.trim_start_matches('/'))
            .map_err(|_| ConfigError::InvalidUrl {
                name: "path",
                value: path.to_string(),
            })
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn parse_http_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or_else(|| ConfigError::InvalidUrl {
            name,
            value: value.to_string(),
        })
}
