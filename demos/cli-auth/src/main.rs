//! cli-auth command-line front end
//!
//! Logs in through the browser, keeps the credentials on disk and makes
//! authenticated calls against the provider's API.
//!
//! Run with:
//!   CLIENT_ID=... REDIRECT_URI=http://127.0.0.1:53682/callback \
//!     cargo run -p cli-auth-demo -- login
//!
//! Variables may also live in a `.env` file in the working directory (or
//! one passed with `--env-file`); the process environment takes precedence.
//!
//! Exit codes: 0 success, 78 setup problem, 75 login timed out,
//! 130 login cancelled, 77 not authenticated, 1 anything else.

mod output;

use clap::{Parser, Subcommand};
use cli_auth::{
    AuthConfig, AuthError, AuthStatus, FailureKind, LoginMode, ManualBrowser, Session,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// OAuth2 + PKCE login for the command line
#[derive(Parser, Debug)]
#[command(name = "cli-auth", version)]
#[command(about = "Log in with your browser and call the API with the stored credentials")]
#[command(after_help = "Configuration is read from CLIENT_ID, REDIRECT_URI, ROOT, \
    AUTHORIZE_URL, TOKEN_URL, SCOPES, LOGIN_TIMEOUT_SECS, BROWSER and CLI_AUTH_CREDENTIALS, \
    or from a .env file.")]
struct Args {
    /// Override the login deadline in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Print the authorization URL instead of opening a browser
    #[arg(long, global = true)]
    no_browser: bool,

    /// Read configuration variables from this file instead of ./.env
    #[arg(long, global = true, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in (reuses valid stored credentials unless --force)
    Login {
        /// Run the browser flow even if already logged in
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Delete stored credentials
    Logout,
    /// Show stored credential status without contacting the provider
    Status,
    /// Show the logged-in account
    Whoami,
    /// List the account's guilds
    Guilds,
    /// GET an API path and print the JSON response
    Get {
        /// Path relative to the API root, e.g. users/@me
        path: String,
    },
}

#[derive(Debug, Deserialize)]
struct Guild {
    id: String,
    name: String,
    #[serde(default)]
    owner: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cli_auth=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err.downcast_ref::<AuthError>() {
                Some(auth) => {
                    output::display_auth_error(auth);
                    exit_code(auth.kind())
                }
                None => {
                    output::display_error(&format!("{err:#}"));
                    1
                }
            };
            ExitCode::from(code)
        }
    }
}

fn exit_code(kind: FailureKind) -> u8 {
    match kind {
        FailureKind::Setup => 78,
        FailureKind::Timeout => 75,
        FailureKind::UserCancelled => 130,
        FailureKind::Unauthenticated => 77,
        _ => 1,
    }
}

/// Load a `.env` file; variables already set in the environment are kept
///
/// Without an explicit path a missing `.env` is not an error.
fn load_env_file(path: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path)
            .map(|()| path.to_path_buf())
            .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))?,
        None => match dotenvy::dotenv() {
            Ok(path) => path,
            Err(e) if e.not_found() => return Ok(None),
            Err(e) => {
                tracing::warn!("Ignoring .env: {e}");
                return Ok(None);
            }
        },
    };
    tracing::debug!(path = %loaded.display(), "Loaded environment file");
    Ok(Some(loaded))
}

async fn run(args: Args) -> anyhow::Result<()> {
    load_env_file(args.env_file.as_deref())?;
    let mut config = AuthConfig::from_env().map_err(AuthError::from)?;
    if let Some(secs) = args.timeout {
        config.login_timeout = Duration::from_secs(secs.max(1));
    }

    let mut builder = Session::builder().config(config);
    if args.no_browser {
        builder = builder.browser(ManualBrowser);
    }
    let session = builder.build()?;
    tracing::debug!(command = ?args.command, store = %session.store().path().display(), "Running");

    match args.command {
        Command::Login { force } => {
            let mode = if force {
                LoginMode::Force
            } else {
                LoginMode::ReuseValid
            };
            let outcome = session.login(mode).await?;
            output::display_login(&outcome);
        }
        Command::Logout => {
            if session.logout()? {
                output::display_success("Logged out");
            } else {
                output::display_info("Not logged in");
            }
        }
        Command::Status => {
            let status = session.status();
            output::display_status(&status, session.store().path());
            if status == AuthStatus::LoggedOut {
                return Err(AuthError::unauthenticated("no stored credentials").into());
            }
        }
        Command::Whoami => {
            let client = session.client()?;
            let me: cli_auth::AccountProfile = client.get_json("users/@me").await?;
            output::display_account(&me);
        }
        Command::Guilds => {
            let client = session.client()?;
            let guilds: Vec<Guild> = client.get_json("users/@me/guilds").await?;
            output::display_guilds(
                guilds
                    .iter()
                    .map(|g| (g.id.as_str(), g.name.as_str(), g.owner)),
            );
        }
        Command::Get { path } => {
            let client = session.client()?;
            let value: serde_json::Value = client.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}
