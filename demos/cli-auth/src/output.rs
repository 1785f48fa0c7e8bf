//! Styled terminal output

use cli_auth::auth::unix_now;
use cli_auth::{AccountProfile, AuthError, AuthStatus, LoginOutcome};
use console::style;
use std::path::Path;

/// Display a success line
pub fn display_success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Display an informational line
pub fn display_info(msg: &str) {
    println!("{} {}", style("•").dim(), msg);
}

/// Display an error on stderr
pub fn display_error(msg: &str) {
    eprintln!("{} {}", style("Error:").red().bold(), msg);
}

/// Display an authentication error, with guidance for setup problems
pub fn display_auth_error(err: &AuthError) {
    display_error(&err.to_string());
    if let AuthError::Setup(setup) = err {
        eprintln!("  {}", style(setup.guidance()).yellow());
    }
}

fn describe_expiry(expires_at: u64) -> String {
    let now = unix_now();
    if expires_at <= now {
        return "expired".to_string();
    }
    let secs = expires_at - now;
    match secs {
        0..=119 => format!("expires in {secs}s"),
        120..=7199 => format!("expires in {}m", secs / 60),
        7200..=172_799 => format!("expires in {}h", secs / 3600),
        _ => format!("expires in {}d", secs / 86_400),
    }
}

/// Display the result of a login
pub fn display_login(outcome: &LoginOutcome) {
    match &outcome.account {
        Some(account) => display_success(&format!(
            "Logged in as {}",
            style(account.display_name()).cyan().bold()
        )),
        None => display_success("Logged in"),
    }
    println!(
        "  {} {}",
        style("Token:").dim(),
        describe_expiry(outcome.tokens.expires_at)
    );
}

/// Display stored credential status
pub fn display_status(status: &AuthStatus, path: &Path) {
    match status {
        AuthStatus::LoggedOut => display_info("Not logged in"),
        AuthStatus::Active {
            expires_at,
            scope,
            account,
        } => {
            display_success("Logged in");
            if let Some(account) = account {
                println!("  {} {}", style("Account:").dim(), account.display_name());
            }
            println!("  {} {}", style("Token:").dim(), describe_expiry(*expires_at));
            if let Some(scope) = scope {
                println!("  {} {}", style("Scopes:").dim(), scope);
            }
        }
        AuthStatus::Expired {
            refreshable,
            account,
        } => {
            println!("{} Access token expired", style("!").yellow().bold());
            if let Some(account) = account {
                println!("  {} {}", style("Account:").dim(), account.display_name());
            }
            if *refreshable {
                println!("  {}", style("It will be refreshed on next use.").dim());
            } else {
                println!("  {}", style("Run `cli-auth login` again.").dim());
            }
        }
    }
    println!("  {} {}", style("Stored at:").dim(), path.display());
}

/// Display an account profile
pub fn display_account(account: &AccountProfile) {
    println!(
        "{} ({})",
        style(account.display_name()).cyan().bold(),
        account.username
    );
    println!("  {} {}", style("Id:").dim(), account.id);
}

/// Display a guild list as `id  name`
pub fn display_guilds<'a>(guilds: impl Iterator<Item = (&'a str, &'a str, bool)>) {
    let mut count = 0;
    for (id, name, owner) in guilds {
        count += 1;
        if owner {
            println!("{id:>20}  {} {}", name, style("(owner)").yellow());
        } else {
            println!("{id:>20}  {name}");
        }
    }
    println!("{}", style(format!("{count} guild(s)")).dim());
}
