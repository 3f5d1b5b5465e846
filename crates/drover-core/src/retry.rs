// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use rand::Rng;

use drover_config::RetryConfig;
use drover_model::ProviderError;

/// How the runtime should react to a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff.
    Transient,
    /// Compact history, then retry from attempt zero.
    Overflow,
    /// Surface as an error event and return to idle.
    Fatal,
}

/// Classify a provider error for the retry loop.
///
/// Parse errors are classified transient but capped at a single retry by
/// [`max_attempts_for`].  Caller-initiated cancellation never produces an
/// error value at all — abort is a state transition handled by the
/// runtime's inbox, so there is no arm for it here.
pub fn classify(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::Transient { .. } | ProviderError::StreamIdle | ProviderError::Parse { .. } => {
            ErrorClass::Transient
        }
        ProviderError::Overflow { .. } => ErrorClass::Overflow,
        ProviderError::Fatal { .. } => ErrorClass::Fatal,
    }
}

/// Retry budget for this error kind.
pub fn max_attempts_for(err: &ProviderError, cfg: &RetryConfig) -> u32 {
    match err {
        ProviderError::Parse { .. } => 1,
        _ => cfg.max_attempts,
    }
}

/// Backoff before retry number `attempt` (0-based):
/// `min(base · 2^attempt, ceiling) + jitter`.
pub fn backoff_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let exp = cfg
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt.min(30)).unwrap_or(u64::MAX));
    let capped = exp.min(cfg.max_delay_ms);
    let jitter = if cfg.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..cfg.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetryConfig {
        RetryConfig::default()
    }

    #[test]
    fn transient_classifications() {
        assert_eq!(
            classify(&ProviderError::from_status(503, "")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProviderError::from_status(429, "")),
            ErrorClass::Transient
        );
        assert_eq!(classify(&ProviderError::network("reset")), ErrorClass::Transient);
        assert_eq!(classify(&ProviderError::StreamIdle), ErrorClass::Transient);
    }

    #[test]
    fn overflow_classification() {
        assert_eq!(
            classify(&ProviderError::from_status(400, "maximum context length exceeded")),
            ErrorClass::Overflow
        );
    }

    #[test]
    fn fatal_classifications() {
        assert_eq!(
            classify(&ProviderError::from_status(401, "bad key")),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&ProviderError::fatal("malformed tool schema")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn parse_errors_get_one_retry() {
        let e = ProviderError::parse("bad frame");
        assert_eq!(classify(&e), ErrorClass::Transient);
        assert_eq!(max_attempts_for(&e, &cfg()), 1);
    }

    #[test]
    fn other_errors_use_configured_attempts() {
        assert_eq!(max_attempts_for(&ProviderError::StreamIdle, &cfg()), 5);
    }

    #[test]
    fn backoff_doubles_until_ceiling() {
        let c = RetryConfig {
            jitter_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(backoff_delay(0, &c), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, &c), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, &c), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, &c), Duration::from_secs(16));
        // 2^5 = 32s exceeds the 30s ceiling.
        assert_eq!(backoff_delay(5, &c), Duration::from_secs(30));
        assert_eq!(backoff_delay(20, &c), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let c = cfg();
        for _ in 0..100 {
            let d = backoff_delay(0, &c);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(1250));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let c = RetryConfig {
            jitter_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(backoff_delay(u32::MAX, &c), Duration::from_secs(30));
    }
}
