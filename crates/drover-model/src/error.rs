// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Classified provider failure.
///
/// The runtime dispatches on the variant: `Transient` errors are retried
/// with backoff, `Overflow` triggers compaction, everything else ends the
/// turn.  Construction goes through [`ProviderError::from_status`] for HTTP
/// responses so the classification rules live in one place.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network reset, 429, 5xx, or an interrupted stream.  Retryable.
    #[error("transient provider error{}: {message}", status_suffix(.status))]
    Transient {
        status: Option<u16>,
        message: String,
    },
    /// The request exceeded the model's context window.
    #[error("context window exceeded: {message}")]
    Overflow { message: String },
    /// Auth failure, invalid request, or malformed tool schema.  Not retryable.
    #[error("fatal provider error: {message}")]
    Fatal { message: String },
    /// A stream frame could not be parsed.  Fatal for the current turn,
    /// eligible for one retry.
    #[error("malformed stream frame: {message}")]
    Parse { message: String },
    /// No frame arrived within the configured idle window.
    #[error("provider stream idle timeout")]
    StreamIdle,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" ({s})"),
        None => String::new(),
    }
}

/// Substrings that identify a context-window rejection across providers.
/// Checked against the response body regardless of status code, since
/// providers disagree on whether overflow is a 400 or a 413.
const OVERFLOW_SIGNALS: &[&str] = &[
    "context window",
    "context length",
    "context_length_exceeded",
    "exceed_context_size_error",
    "maximum context",
    "too many tokens",
];

impl ProviderError {
    /// Classify an HTTP error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        if Self::is_overflow_signal(body) {
            return Self::Overflow {
                message: truncate_body(body),
            };
        }
        match status {
            429 => Self::Transient {
                status: Some(status),
                message: truncate_body(body),
            },
            s if s >= 500 => Self::Transient {
                status: Some(status),
                message: truncate_body(body),
            },
            _ => Self::Fatal {
                message: format!("HTTP {status}: {}", truncate_body(body)),
            },
        }
    }

    /// A network-level failure with no HTTP response.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Return true when `body` matches a known context-overflow signal.
    pub fn is_overflow_signal(body: &str) -> bool {
        let lower = body.to_ascii_lowercase();
        OVERFLOW_SIGNALS.iter().any(|s| lower.contains(s))
    }
}

/// Error bodies can carry entire rejected requests; keep the first KB.
fn truncate_body(body: &str) -> String {
    if body.len() <= 1024 {
        body.to_string()
    } else {
        let mut cut = 1024;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_transient() {
        let e = ProviderError::from_status(429, "rate limited");
        assert!(matches!(e, ProviderError::Transient { status: Some(429), .. }));
    }

    #[test]
    fn status_503_is_transient() {
        let e = ProviderError::from_status(503, "upstream unavailable");
        assert!(matches!(e, ProviderError::Transient { status: Some(503), .. }));
    }

    #[test]
    fn status_401_is_fatal() {
        let e = ProviderError::from_status(401, "bad key");
        assert!(matches!(e, ProviderError::Fatal { .. }));
    }

    #[test]
    fn status_400_is_fatal() {
        let e = ProviderError::from_status(400, "invalid request");
        assert!(matches!(e, ProviderError::Fatal { .. }));
    }

    #[test]
    fn overflow_signal_wins_over_status() {
        // Some providers report overflow as a 400; the body decides.
        let e = ProviderError::from_status(
            400,
            r#"{"error":{"type":"exceed_context_size_error","n_ctx":54272}}"#,
        );
        assert!(matches!(e, ProviderError::Overflow { .. }));
    }

    #[test]
    fn overflow_signal_detection_is_case_insensitive() {
        assert!(ProviderError::is_overflow_signal(
            "This model's maximum Context Length is 8192 tokens"
        ));
        assert!(!ProviderError::is_overflow_signal("some other error"));
    }

    #[test]
    fn network_errors_have_no_status() {
        let e = ProviderError::network("connection reset by peer");
        assert!(matches!(e, ProviderError::Transient { status: None, .. }));
    }

    #[test]
    fn display_includes_status() {
        let e = ProviderError::from_status(503, "oops");
        assert!(e.to_string().contains("503"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(5000);
        let e = ProviderError::from_status(500, &body);
        assert!(e.to_string().len() < 1200);
    }
}
