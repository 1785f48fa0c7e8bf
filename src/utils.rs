//! String helpers for log output
//!
//! Provider error bodies and tokens end up in log lines and error messages.
//! These helpers bound their size on UTF-8 boundaries and keep secrets out.

/// Longest provider body kept in an error message
pub const MAX_BODY_BYTES: usize = 512;

/// Safely truncate a string at a UTF-8 character boundary.
///
/// Returns a slice of at most `max_bytes` bytes, ensuring the result
/// is valid UTF-8 by finding the last valid character boundary.
///
/// # Example
/// ```
/// use cli_auth::utils::safe_truncate;
///
/// // Emoji is 4 bytes - truncating at byte 10 would cut it in half
/// let text = "Status: 🔍 Active";
/// let result = safe_truncate(text, 10);
/// assert_eq!(result, "Status: ");
/// ```
#[inline]
#[must_use]
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }

    &s[..boundary]
}

/// Truncate a string for display with ellipsis.
///
/// # Example
/// ```
/// use cli_auth::utils::truncate_for_display;
///
/// let text = "This is a long message";
/// assert_eq!(truncate_for_display(text, 10), "This is a ...");
/// ```
#[must_use]
pub fn truncate_for_display(s: &str, max_bytes: usize) -> String {
    let truncated = safe_truncate(s, max_bytes);
    if truncated.len() < s.len() {
        format!("{truncated}...")
    } else {
        truncated.to_string()
    }
}

/// Mask a secret for logs, keeping only a short prefix for correlation.
///
/// Secrets shorter than 12 bytes are masked entirely.
///
/// # Example
/// ```
/// use cli_auth::utils::redact;
///
/// assert_eq!(redact("mfa.abcdefghijklmnop"), "mfa.…(20 bytes)");
/// assert_eq!(redact("short"), "…(5 bytes)");
/// ```
#[must_use]
pub fn redact(secret: &str) -> String {
    let prefix = if secret.len() >= 12 {
        safe_truncate(secret, 4)
    } else {
        ""
    };
    format!("{prefix}…({} bytes)", secret.len())
}

/// Bound a response body for inclusion in an error, collapsing whitespace
#[must_use]
pub fn summarize_body(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_for_display(&collapsed, MAX_BODY_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_truncate_ascii() {
        let text = "Hello, World!";
        assert_eq!(safe_truncate(text, 7), "Hello, ");
        assert_eq!(safe_truncate(text, 100), text);
        assert_eq!(safe_truncate(text, 0), "");
    }

    #[test]
    fn test_safe_truncate_multibyte() {
        // 'é' is 2 bytes in UTF-8
        let text = "Café";
        assert_eq!(safe_truncate(text, 4), "Caf");
        assert_eq!(safe_truncate(text, 5), "Café");
    }

    #[test]
    fn test_truncate_for_display_emoji() {
        let text = "Hello 🌍 World";
        assert_eq!(truncate_for_display(text, 7), "Hello ...");
    }

    #[test]
    fn test_redact_hides_secret() {
        let token = "MTk4NjIyNDgzNDcxOTI1MjQ4.Cl2FMQ.ZnCjm1XVW7vRze4b7Cq4se7kKWs";
        let masked = redact(token);
        assert!(masked.starts_with("MTk4"));
        assert!(!masked.contains("ZnCjm1XVW7vRze4b7Cq4se7kKWs"));
    }

    #[test]
    fn test_redact_short_secret() {
        assert_eq!(redact(""), "…(0 bytes)");
        assert_eq!(redact("abc"), "…(3 bytes)");
    }

    #[test]
    fn test_summarize_body() {
        let body = format!("<html>\n  <body>{}</body>\n</html>", "x".repeat(1000));
        let summary = summarize_body(&body);
        assert!(summary.len() <= MAX_BODY_BYTES + 3);
        assert!(summary.starts_with("<html> <body>"));
        assert!(summary.ends_with("..."));
    }
}
