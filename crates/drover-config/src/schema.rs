// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Retry behaviour for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base backoff delay for the first retry, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on the exponential backoff delay, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay, in milliseconds.
    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
    /// Maximum number of retry attempts before the error is surfaced as fatal.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            jitter_ms: default_retry_jitter_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_retry_jitter_ms() -> u64 {
    250
}
fn default_retry_max_attempts() -> u32 {
    5
}

/// Context compaction behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Token fraction at which proactive compaction triggers (0.0–1.0).
    #[serde(default = "default_compaction_threshold")]
    pub threshold: f32,
    /// Target applied when the provider has already rejected a request for
    /// size.  Must be below `threshold`: the forced pass preserves fewer
    /// recent turns until the surviving history fits under this fraction,
    /// so the retried request has real headroom.
    #[serde(default = "default_overflow_threshold")]
    pub overflow_threshold: f32,
    /// Number of most-recent conversation turns preserved verbatim.  A turn
    /// starts at a user message; tool calls and results belong to the turn
    /// of the assistant message that requested them.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: default_compaction_threshold(),
            overflow_threshold: default_overflow_threshold(),
            keep_recent_turns: default_keep_recent_turns(),
        }
    }
}

fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_overflow_threshold() -> f32 {
    0.5
}
fn default_keep_recent_turns() -> usize {
    4
}

/// Watchdog timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-tool execution timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_secs: u64,
    /// Maximum time without any frame from the provider stream before the
    /// turn is treated as interrupted, in seconds.
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool_secs: default_tool_timeout_secs(),
            stream_idle_secs: default_stream_idle_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_stream_idle_secs() -> u64 {
    120
}

/// Top-level runtime configuration.
///
/// All fields have serde defaults so a host application can embed a partial
/// YAML/JSON fragment and get spec-default behaviour for everything it does
/// not mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Context window of the configured model, in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Per-message token overhead added to the size estimate (role markers,
    /// separators and wire framing the character heuristic cannot see).
    #[serde(default = "default_message_overhead_tokens")]
    pub message_overhead_tokens: usize,
    /// Tools offered to the model.  `None` means every registered tool.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    /// Free-form feature switches forwarded to tools via their context.
    #[serde(default)]
    pub features: HashMap<String, bool>,
    /// Full system prompt override.  When unset a short built-in prompt is used.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Working directory handed to tools.  Defaults to the process cwd.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Whether prompts queued behind a busy runtime survive a fatal provider
    /// error.  When `false` they are discarded with an error event each.
    #[serde(default = "default_preserve_queued")]
    pub preserve_queued_on_error: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            compaction: CompactionConfig::default(),
            timeouts: TimeoutConfig::default(),
            context_window: default_context_window(),
            message_overhead_tokens: default_message_overhead_tokens(),
            enabled_tools: None,
            features: HashMap::new(),
            system_prompt: None,
            working_dir: None,
            preserve_queued_on_error: default_preserve_queued(),
        }
    }
}

fn default_context_window() -> usize {
    128_000
}
fn default_message_overhead_tokens() -> usize {
    4
}
fn default_preserve_queued() -> bool {
    true
}

impl RuntimeConfig {
    /// Parse a configuration fragment from YAML.  Missing fields fall back
    /// to their defaults, so `""` yields `RuntimeConfig::default()`.
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.retry.jitter_ms, 250);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.compaction.threshold, 0.8);
        assert_eq!(cfg.compaction.overflow_threshold, 0.5);
        assert_eq!(cfg.compaction.keep_recent_turns, 4);
        assert_eq!(cfg.timeouts.tool_secs, 60);
        assert_eq!(cfg.timeouts.stream_idle_secs, 120);
        assert!(cfg.preserve_queued_on_error);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg = RuntimeConfig::from_yaml_str("").unwrap();
        assert_eq!(cfg.context_window, 128_000);
        assert!(cfg.enabled_tools.is_none());
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg = RuntimeConfig::from_yaml_str(
            "retry:\n  max_attempts: 2\ncontext_window: 8192\n",
        )
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.context_window, 8192);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.compaction.threshold, 0.8);
    }

    #[test]
    fn enabled_tools_list_parses() {
        let cfg = RuntimeConfig::from_yaml_str("enabled_tools: [echo, grep]\n").unwrap();
        assert_eq!(
            cfg.enabled_tools.as_deref(),
            Some(&["echo".to_string(), "grep".to_string()][..])
        );
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(RuntimeConfig::from_yaml_str("retry: [not, a, map]").is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retry.max_attempts, cfg.retry.max_attempts);
        assert_eq!(back.context_window, cfg.context_window);
    }
}
