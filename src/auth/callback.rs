//! Loopback HTTP listener that receives the authorization redirect
//!
//! The listener binds `127.0.0.1` on the port from the registered redirect
//! URI and waits for exactly one request on the redirect path whose `state`
//! matches the one issued for this attempt. Anything else is answered and
//! ignored. Dropping the listener (or returning from
//! [`CallbackListener::wait_for_result`]) releases the port.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use url::Url;

use super::pkce::AuthorizationState;

/// Largest request head we are willing to buffer
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Time a single connection gets to send its request line and headers
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome delivered by the provider's redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    /// User approved; the code can be exchanged
    Code {
        /// Authorization code
        code: String,
    },
    /// Provider redirected with an error (`access_denied` when the user
    /// declined consent)
    Denied {
        /// OAuth error code
        error: String,
        /// Optional description
        description: Option<String>,
    },
}

/// Errors from the callback listener
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Port already bound by another process
    #[error("127.0.0.1:{port} is already in use")]
    PortUnavailable {
        /// The fixed callback port
        port: u16,
    },

    /// No valid callback before the deadline
    #[error("no callback received within {}s", .0.as_secs())]
    Timeout(Duration),

    /// Socket error while binding or serving
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the listener does with one inbound request
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    NotFound,
    MethodNotAllowed,
    Rejected(&'static str),
    Accepted(CallbackResult),
}

struct Expected {
    path: String,
    state: AuthorizationState,
}

/// One-shot loopback callback server
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
    path: String,
    state: AuthorizationState,
}

impl CallbackListener {
    /// Bind `127.0.0.1:port` and prepare to accept the redirect on `path`
    ///
    /// Port `0` picks an ephemeral port, which is only useful in tests since
    /// real redirect URIs are registered with a fixed port.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::PortUnavailable`] if the port is taken.
    pub async fn bind(
        port: u16,
        path: impl Into<String>,
        state: AuthorizationState,
    ) -> Result<Self, CallbackError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AddrInUse => CallbackError::PortUnavailable { port },
                _ => CallbackError::Io(e),
            })?;
        let addr = listener.local_addr()?;

        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        tracing::debug!(%addr, %path, "Callback listener bound");
        Ok(Self {
            listener,
            addr,
            path,
            state,
        })
    }

    /// Port the listener is bound to
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Redirect URI this listener serves
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }

    /// Wait for a valid callback, then close the listener
    ///
    /// Requests for other paths or with a missing or wrong `state` are
    /// answered with an error page and do not end the wait.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Timeout`] if nothing valid arrives in time.
    pub async fn wait_for_result(self, timeout: Duration) -> Result<CallbackResult, CallbackError> {
        let deadline = Instant::now() + timeout;
        let expected = Arc::new(Expected {
            path: self.path,
            state: self.state,
        });
        let (tx, mut rx) = mpsc::channel::<CallbackResult>(1);
        let mut connections = JoinSet::new();
        let listener = self.listener;

        let outcome = tokio::time::timeout_at(deadline, async {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::trace!(%peer, "Callback connection accepted");
                            connections.spawn(serve_connection(stream, expected.clone(), tx.clone()));
                        }
                        Err(e) => tracing::warn!("Callback accept failed: {e}"),
                    },
                    Some(result) = rx.recv() => return result,
                    // Reap finished connection tasks so the set stays small
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
        })
        .await;

        // Dropping the set aborts connections still in flight; dropping the
        // listener releases the port.
        connections.shutdown().await;
        drop(listener);

        match outcome {
            Ok(result) => {
                tracing::debug!("Callback received");
                Ok(result)
            }
            Err(_) => {
                tracing::debug!("Callback listener timed out");
                Err(CallbackError::Timeout(timeout))
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    expected: Arc<Expected>,
    tx: mpsc::Sender<CallbackResult>,
) {
    let head = match tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut stream)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            tracing::trace!("Callback connection read failed: {e}");
            return;
        }
        Err(_) => {
            tracing::trace!("Callback connection idle, closing");
            return;
        }
    };

    let Some((method, target)) = parse_request_line(&head) else {
        let _ = write_page(&mut stream, 400, "Bad Request", "Malformed request.").await;
        return;
    };

    let disposition = if method == "GET" {
        inspect(target, &expected.path, &expected.state)
    } else {
        Disposition::MethodNotAllowed
    };

    match disposition {
        Disposition::Accepted(result) => {
            let (title, message) = match &result {
                CallbackResult::Code { .. } => (
                    "Login complete",
                    "You may close this window now and return to the terminal.".to_string(),
                ),
                CallbackResult::Denied { error, .. } => (
                    "Login not completed",
                    format!(
                        "The provider reported <code>{}</code>. You may close this window now.",
                        escape_html(error)
                    ),
                ),
            };
            let _ = write_page(&mut stream, 200, title, &message).await;
            let _ = tx.send(result).await;
        }
        Disposition::Rejected(reason) => {
            tracing::warn!(reason, "Ignoring callback that does not belong to this login attempt");
            let _ = write_page(&mut stream, 400, "Invalid callback", reason).await;
        }
        Disposition::NotFound => {
            let _ = write_page(&mut stream, 404, "Not Found", "Nothing here.").await;
        }
        Disposition::MethodNotAllowed => {
            let _ = write_page(&mut stream, 405, "Method Not Allowed", "Use GET.").await;
        }
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    buffer.truncate(MAX_REQUEST_BYTES);
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    parts.next()?.starts_with("HTTP/").then_some((method, target))
}

/// Decide what to do with a request target such as `/callback?code=..&state=..`
fn inspect(target: &str, path: &str, state: &AuthorizationState) -> Disposition {
    let Ok(url) = Url::parse(&format!("http://127.0.0.1{target}")) else {
        return Disposition::Rejected("Malformed request target.");
    };
    if url.path() != path {
        return Disposition::NotFound;
    }

    let mut code = None;
    let mut received_state = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => received_state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    match received_state {
        Some(ref s) if state.matches(s) => {}
        Some(_) => return Disposition::Rejected("State does not match this login attempt."),
        None => return Disposition::Rejected("Missing state parameter."),
    }

    if let Some(error) = error {
        return Disposition::Accepted(CallbackResult::Denied { error, description });
    }
    match code {
        Some(code) if !code.is_empty() => Disposition::Accepted(CallbackResult::Code { code }),
        _ => Disposition::Rejected("Missing code parameter."),
    }
}

async fn write_page(
    stream: &mut TcpStream,
    status: u16,
    title: &str,
    message: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Method Not Allowed",
    };
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: system-ui; text-align: center; padding: 50px;\">\n\
         <h1>{title}</h1>\n<p>{message}</p>\n</body>\n</html>"
    );
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn escape_html(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            c => c.to_string(),
        })
        .collect()
}
