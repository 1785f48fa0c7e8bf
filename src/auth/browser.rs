//! Browser driver
//!
//! Opens the authorization URL for the user. When a known Chromium or Firefox
//! executable is available it is launched as a dedicated instance with a
//! throw-away profile, so the login flow can tell when the user closes the
//! window. Otherwise the platform opener hands the URL to the default browser
//! and the flow relies on its deadline.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Chromium-family executables, in preference order
const CHROMIUM_NAMES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "microsoft-edge",
    "brave-browser",
];

/// Firefox executables
const FIREFOX_NAMES: &[&str] = &["firefox"];

/// Grace period for the dedicated instance to exit after being killed
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How a browser session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserOutcome {
    /// The login flow finished and asked the browser to close
    Completed,
    /// The user closed the browser before the flow finished
    Abandoned,
    /// The deadline passed with the browser still open
    TimedOut,
}

/// Errors from the browser driver
#[derive(Debug, Error)]
pub enum BrowserError {
    /// No usable browser or opener was found
    #[error("no browser available: {0}")]
    Unavailable(String),

    /// The browser process could not be started
    #[error("failed to launch {path}: {source}")]
    Spawn {
        /// Executable that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// I/O error while preparing the browser profile
    #[error("browser I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Presents an authorization URL to the user
///
/// `authorize` returns once the browser is gone, `cancel` fires, or
/// `timeout` elapses. Implementations must release whatever they launched
/// before returning.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Show `url` and wait for the session to end
    async fn authorize(
        &self,
        url: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<BrowserOutcome, BrowserError>;
}

/// Family of a discovered browser executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    /// Chromium, Chrome, Edge or Brave
    Chromium,
    /// Firefox
    Firefox,
    /// Platform URL opener (`xdg-open`, `open`, `start`)
    Opener,
}

impl BrowserKind {
    /// Guess the family from an executable path
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.contains("firefox") {
            Self::Firefox
        } else if ["chrom", "edge", "brave"].iter().any(|k| name.contains(k)) {
            Self::Chromium
        } else {
            Self::Opener
        }
    }

    /// Whether the process lives exactly as long as the browser window
    #[must_use]
    pub fn is_dedicated(self) -> bool {
        !matches!(self, Self::Opener)
    }
}

/// Arguments that start a dedicated instance on `url` with `profile`
#[must_use]
pub fn launch_args(kind: BrowserKind, profile: &Path, url: &str) -> Vec<String> {
    match kind {
        BrowserKind::Chromium => vec![
            format!("--user-data-dir={}", profile.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--new-window".to_string(),
            url.to_string(),
        ],
        BrowserKind::Firefox => vec![
            "--new-instance".to_string(),
            "--profile".to_string(),
            profile.display().to_string(),
            url.to_string(),
        ],
        BrowserKind::Opener => opener_args(url),
    }
}

#[cfg(target_os = "windows")]
fn opener_args(url: &str) -> Vec<String> {
    vec!["/C".to_string(), "start".to_string(), String::new(), url.to_string()]
}

#[cfg(not(target_os = "windows"))]
fn opener_args(url: &str) -> Vec<String> {
    vec![url.to_string()]
}

/// Browser driver backed by a local executable
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser {
    executable: Option<PathBuf>,
}

impl SystemBrowser {
    /// Driver that discovers a browser when `authorize` is called
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver that always launches `executable`
    #[must_use]
    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(executable.into()),
        }
    }

    /// Resolve the executable to launch
    ///
    /// Order: explicit override, known dedicated browsers on `PATH`, common
    /// install locations, then the platform opener.
    ///
    /// # Errors
    ///
    /// Returns [`BrowserError::Unavailable`] if nothing can open a URL.
    pub fn discover(&self) -> Result<(PathBuf, BrowserKind), BrowserError> {
        if let Some(ref executable) = self.executable {
            let path = which::which(executable).unwrap_or_else(|_| executable.clone());
            if !path.exists() {
                return Err(BrowserError::Unavailable(format!(
                    "{} does not exist",
                    executable.display()
                )));
            }
            return Ok((path.clone(), BrowserKind::from_path(&path)));
        }

        for name in CHROMIUM_NAMES {
            if let Ok(path) = which::which(name) {
                return Ok((path, BrowserKind::Chromium));
            }
        }
        for name in FIREFOX_NAMES {
            if let Ok(path) = which::which(name) {
                return Ok((path, BrowserKind::Firefox));
            }
        }

        for path in install_locations() {
            if path.is_file() {
                let kind = BrowserKind::from_path(&path);
                return Ok((path, kind));
            }
        }

        platform_opener()
            .ok_or_else(|| BrowserError::Unavailable("no browser or URL opener found".to_string()))
    }
}

#[cfg(target_os = "macos")]
fn install_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        PathBuf::from("/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"),
        PathBuf::from("/Applications/Brave Browser.app/Contents/MacOS/Brave Browser"),
        PathBuf::from("/Applications/Firefox.app/Contents/MacOS/firefox"),
    ]
}

#[cfg(target_os = "windows")]
fn install_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe"),
        PathBuf::from(r"C:\Program Files\Mozilla Firefox\firefox.exe"),
    ]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn install_locations() -> Vec<PathBuf> {
    let mut locations = vec![
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/snap/bin/chromium"),
        PathBuf::from("/usr/bin/firefox"),
    ];
    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".local/bin/chromium"));
    }
    locations
}

#[cfg(target_os = "macos")]
fn platform_opener() -> Option<(PathBuf, BrowserKind)> {
    which::which("open").ok().map(|p| (p, BrowserKind::Opener))
}

#[cfg(target_os = "windows")]
fn platform_opener() -> Option<(PathBuf, BrowserKind)> {
    which::which("cmd").ok().map(|p| (p, BrowserKind::Opener))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_opener() -> Option<(PathBuf, BrowserKind)> {
    ["xdg-open", "gio", "wslview"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .map(|p| (p, BrowserKind::Opener))
}

#[async_trait]
impl BrowserDriver for SystemBrowser {
    async fn authorize(
        &self,
        url: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<BrowserOutcome, BrowserError> {
        let (path, kind) = self.discover()?;

        // Profile lives until this function returns
        let profile = tempfile::Builder::new()
            .prefix("cli-auth-browser-")
            .tempdir()?;
        let args = launch_args(kind, profile.path(), url);

        tracing::info!(browser = %path.display(), ?kind, "Opening browser for login");
        let mut child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(kind.is_dedicated())
            .spawn()
            .map_err(|source| BrowserError::Spawn {
                path: path.clone(),
                source,
            })?;

        if !kind.is_dedicated() {
            // The opener exits as soon as it has handed off the URL
            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!(%status, "URL opener exited with an error");
                }
                Err(e) => tracing::warn!("Failed to wait for URL opener: {e}"),
                Ok(_) => {}
            }
            return Ok(tokio::select! {
                () = cancel.cancelled() => BrowserOutcome::Completed,
                () = tokio::time::sleep(timeout) => BrowserOutcome::TimedOut,
            });
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::debug!(%status, "Browser exited"),
                    Err(e) => tracing::warn!("Failed to wait for browser: {e}"),
                }
                return Ok(BrowserOutcome::Abandoned);
            }
            () = cancel.cancelled() => BrowserOutcome::Completed,
            () = tokio::time::sleep(timeout) => BrowserOutcome::TimedOut,
        };

        close_browser(&mut child).await;
        Ok(outcome)
    }
}

async fn close_browser(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Browser already gone: {e}");
        return;
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!("Browser did not exit after kill");
    }
}

/// Driver that prints the URL and leaves opening it to the user
///
/// Used with `--no-browser` and on machines without a display. The flow
/// still finishes through the loopback redirect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualBrowser;

#[async_trait]
impl BrowserDriver for ManualBrowser {
    async fn authorize(
        &self,
        url: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<BrowserOutcome, BrowserError> {
        tracing::info!(%url, "Waiting for a manual browser login");
        eprintln!("Open this URL in a browser on this machine to log in:\n\n  {url}\n");
        Ok(tokio::select! {
            () = cancel.cancelled() => BrowserOutcome::Completed,
            () = tokio::time::sleep(timeout) => BrowserOutcome::TimedOut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manual_browser_logs_url() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = ManualBrowser
            .authorize(
                "http://127.0.0.1:1/authorize?state=abc",
                Duration::from_secs(5),
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome, BrowserOutcome::Completed);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("http://127.0.0.1:1/authorize?state=abc"), "{output}");
    }

    #[test]
    fn test_kind_from_path() {
        assert_eq!(
            BrowserKind::from_path(Path::new("/usr/bin/google-chrome-stable")),
            BrowserKind::Chromium
        );
        assert_eq!(
            BrowserKind::from_path(Path::new("/usr/bin/chromium-browser")),
            BrowserKind::Chromium
        );
        assert_eq!(
            BrowserKind::from_path(Path::new("/Applications/Firefox.app/Contents/MacOS/firefox")),
            BrowserKind::Firefox
        );
        assert_eq!(
            BrowserKind::from_path(Path::new("/usr/bin/xdg-open")),
            BrowserKind::Opener
        );
    }

    #[test]
    fn test_chromium_args_isolate_profile() {
        let args = launch_args(
            BrowserKind::Chromium,
            Path::new("/tmp/profile"),
            "https://example.com/authorize",
        );
        assert_eq!(args[0], "--user-data-dir=/tmp/profile");
        assert!(args.contains(&"--no-first-run".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/authorize"));
    }

    #[test]
    fn test_firefox_args_isolate_profile() {
        let args = launch_args(BrowserKind::Firefox, Path::new("/tmp/p"), "https://x");
        assert_eq!(args, vec!["--new-instance", "--profile", "/tmp/p", "https://x"]);
    }

    #[test]
    fn test_missing_override_is_unavailable() {
        let browser = SystemBrowser::with_executable("/nonexistent/browser-binary");
        assert!(matches!(
            browser.discover(),
            Err(BrowserError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_browser_completes_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = ManualBrowser
            .authorize("https://x", Duration::from_secs(5), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, BrowserOutcome::Completed);
    }

    #[tokio::test]
    async fn test_manual_browser_times_out() {
        let outcome = ManualBrowser
            .authorize("https://x", Duration::from_millis(20), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, BrowserOutcome::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dedicated_instance_exit_is_abandoned() {
        // A "browser" that exits immediately behaves like a user closing it
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-chromium");
        std::fs::write(&fake, "#!/bin/sh\nexit 0\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let outcome = SystemBrowser::with_executable(&fake)
            .authorize("https://x", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, BrowserOutcome::Abandoned);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dedicated_instance_is_closed_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-chromium");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = SystemBrowser::with_executable(&fake)
            .authorize("https://x", Duration::from_secs(10), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, BrowserOutcome::Completed);
    }
}
