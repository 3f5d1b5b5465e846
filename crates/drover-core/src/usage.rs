// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use drover_model::Message;

/// Running estimate of the next outgoing request's size.
///
/// The estimate is cumulative message sizes (4-chars-per-token heuristic)
/// plus a model-specific per-message overhead for role markers and wire
/// framing.  It deliberately over-counts slightly: compaction firing a turn
/// early is cheap, an overflow rejection is not.
#[derive(Debug, Clone, Copy)]
pub struct UsageTracker {
    pub context_window: usize,
    pub overhead_per_message: usize,
}

impl UsageTracker {
    pub fn new(context_window: usize, overhead_per_message: usize) -> Self {
        Self {
            context_window,
            overhead_per_message,
        }
    }

    /// Estimated tokens for sending `messages` as the next request.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| m.approx_tokens() + self.overhead_per_message)
            .sum()
    }

    /// Fraction of the context window the estimate consumes (0.0–1.0+).
    pub fn fraction(&self, messages: &[Message]) -> f32 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.estimate(messages) as f32 / self.context_window as f32
    }

    /// True when the estimate crosses `threshold · context_window`.
    pub fn needs_compaction(&self, messages: &[Message], threshold: f32) -> bool {
        self.fraction(messages) >= threshold
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_sums_tokens_plus_overhead() {
        let t = UsageTracker::new(1000, 4);
        let msgs = vec![Message::user("12345678"), Message::assistant("abcd")];
        // 2 + 4 overhead, 1 + 4 overhead
        assert_eq!(t.estimate(&msgs), 11);
    }

    #[test]
    fn empty_history_estimates_zero() {
        let t = UsageTracker::new(1000, 4);
        assert_eq!(t.estimate(&[]), 0);
        assert_eq!(t.fraction(&[]), 0.0);
    }

    #[test]
    fn zero_window_does_not_divide_by_zero() {
        let t = UsageTracker::new(0, 4);
        assert_eq!(t.fraction(&[Message::user("hi")]), 0.0);
        assert!(!t.needs_compaction(&[Message::user("hi")], 0.8));
    }

    #[test]
    fn needs_compaction_at_threshold() {
        let t = UsageTracker::new(10, 0);
        // 20 chars = 5 tokens in a 10-token window = 0.5
        let msgs = vec![Message::user("12345678901234567890")];
        assert!(t.needs_compaction(&msgs, 0.5));
        assert!(!t.needs_compaction(&msgs, 0.6));
    }

    #[test]
    fn fraction_grows_with_history() {
        let t = UsageTracker::new(100, 4);
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("hi"), Message::assistant("a longer reply here")];
        assert!(t.fraction(&long) > t.fraction(&short));
    }
}
