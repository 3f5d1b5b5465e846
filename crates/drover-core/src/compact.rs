// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tracing::warn;

use drover_model::{ChatProvider, CompletionRequest, Message, MessageContent, Role};

use crate::{MessageStore, UsageTracker};

/// Label prefixed to every synthetic summary message so consumers (and the
/// model) can tell replayed context from live conversation.
pub const SUMMARY_NOTE_LABEL: &str = "prior-conversation-summary";

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Text used when the summarization call itself fails: the window is still
/// dropped so the session recovers, it just loses detail.
const FALLBACK_NOTICE: &str =
    "Earlier history was dropped to prevent a context-window overflow. The \
     assistant may lack full context for earlier decisions; ask the user to \
     re-provide any missing requirements if needed.";

/// Statistics from one compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Messages removed (always ≥ 2, so history length strictly decreases).
    pub removed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// False when the deterministic fallback replaced the model summary.
    pub summarized_by_model: bool,
}

/// Collapses the oldest window of history into one synthetic summary
/// message to regain context-window headroom.
pub struct Compactor {
    /// Most-recent conversation turns preserved verbatim.
    pub keep_recent_turns: usize,
}

impl Compactor {
    pub fn new(keep_recent_turns: usize) -> Self {
        Self { keep_recent_turns }
    }

    /// Run one compaction pass toward `target`, the fraction of the
    /// context window the surviving history may occupy.  Returns `None`
    /// when there is nothing worth summarizing (too few old messages to
    /// shrink the history).
    pub async fn compact(
        &self,
        store: &mut MessageStore,
        provider: &dyn ChatProvider,
        tracker: &UsageTracker,
        target: f32,
    ) -> Option<CompactionOutcome> {
        let window = select_window(store.messages(), self.keep_recent_turns, tracker, target)?;
        let tokens_before = store.token_count();

        let history_text = serialize_history(&store.messages()[window.clone()]);
        let req = CompletionRequest {
            messages: vec![
                Message::system(SUMMARIZE_PROMPT),
                Message::user(history_text),
            ],
            tools: vec![],
            stream: false,
            model: None,
        };

        let (text, summarized_by_model) = match provider.one_shot(req).await {
            Ok(msg) => match msg.as_text() {
                Some(t) if !t.trim().is_empty() => (t.to_string(), true),
                _ => {
                    warn!("compaction summary was empty; using deterministic fallback notice");
                    (FALLBACK_NOTICE.to_string(), false)
                }
            },
            Err(e) => {
                warn!("compaction model call failed, using deterministic fallback notice: {e}");
                (FALLBACK_NOTICE.to_string(), false)
            }
        };

        // The one permitted mutation of historical messages: a compound
        // delete+insert, recorded in metadata for auditability.
        let summary = Message::system(format!("[{SUMMARY_NOTE_LABEL}] {text}")).with_metadata(
            serde_json::json!({
                "compaction": {
                    "replaced": window.len(),
                    "from": window.start,
                    "to": window.end,
                }
            }),
        );
        let removed = store.compact_replace(window, summary);

        Some(CompactionOutcome {
            removed,
            tokens_before,
            tokens_after: store.token_count(),
            summarized_by_model,
        })
    }
}

/// Pick the oldest contiguous window of messages to summarize.
///
/// Starts from the configured `keep_recent_turns`.  When the surviving
/// messages alone would still cross `target · context_window`, fewer
/// turns are preserved, down to the most recent one — this is how a
/// forced pass after a size rejection gets its more aggressive target.
/// Returns `None` when even the configured split has nothing to
/// summarize.
fn select_window(
    messages: &[Message],
    keep_recent_turns: usize,
    tracker: &UsageTracker,
    target: f32,
) -> Option<std::ops::Range<usize>> {
    let mut keep = keep_recent_turns.max(1);
    let mut window = select_window_keeping(messages, keep)?;
    while keep > 1 && tracker.context_window > 0 {
        let survivors = tracker.estimate(&messages[..window.start])
            + tracker.estimate(&messages[window.end..]);
        if (survivors as f32) < target * tracker.context_window as f32 {
            break;
        }
        keep -= 1;
        match select_window_keeping(messages, keep) {
            Some(w) => window = w,
            None => break,
        }
    }
    Some(window)
}

/// The window boundary for one specific number of preserved turns
/// (always at least one).
///
/// The window starts after the initial system message and ends at the
/// boundary of the most recent `keep_recent_turns` turns (a turn starts at
/// a user message).  The boundary backs off past tool calls and results so
/// a tool exchange is never severed — a summarized-away tool call whose
/// result survives would make providers reject the next request.
fn select_window_keeping(
    messages: &[Message],
    keep_recent_turns: usize,
) -> Option<std::ops::Range<usize>> {
    let start = messages
        .iter()
        .position(|m| m.role != Role::System)
        .unwrap_or(messages.len());

    // Boundary: index of the Nth-most-recent user message.
    let user_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();
    if user_positions.len() <= keep_recent_turns {
        return None;
    }
    let mut end = user_positions[user_positions.len() - keep_recent_turns];

    // Keep tool exchanges intact in the preserved tail.
    while end > start
        && matches!(
            messages[end].content,
            MessageContent::ToolCall { .. } | MessageContent::ToolResult { .. }
        )
    {
        end -= 1;
    }

    // Replacing fewer than two messages with one cannot shrink history.
    if end.saturating_sub(start) < 2 {
        return None;
    }
    Some(start..end)
}

/// Serialise a message window into plain text for the compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use drover_model::{ProviderError, ProviderScript, ScriptedMockProvider};

    fn seeded_store() -> MessageStore {
        let mut s = MessageStore::new("s1");
        s.append(Message::system("sys"));
        s.append(Message::user("old question one"));
        s.append(Message::assistant("old answer one"));
        s.append(Message::user("old question two"));
        s.append(Message::assistant("old answer two"));
        s.append(Message::user("recent question"));
        s.append(Message::assistant("recent answer"));
        s
    }

    /// Tracker that exerts no target pressure on the window split.
    fn no_pressure() -> UsageTracker {
        UsageTracker::new(1_000_000, 0)
    }

    #[test]
    fn window_excludes_system_and_recent_turns() {
        let s = seeded_store();
        let w = select_window_keeping(s.messages(), 1).unwrap();
        // Everything between the system message and the last user turn.
        assert_eq!(w, 1..5);
    }

    #[test]
    fn window_is_none_when_history_is_all_recent() {
        let s = seeded_store();
        assert!(select_window_keeping(s.messages(), 3).is_none());
        assert!(select_window(s.messages(), 3, &no_pressure(), 0.8).is_none());
    }

    #[test]
    fn tool_exchange_is_never_split_across_the_boundary() {
        let mut s = MessageStore::new("s1");
        s.append(Message::system("sys"));
        s.append(Message::user("q1"));
        s.append(Message::tool_call("t1", "echo", "{}"));
        s.append(Message::tool_result("t1", "out"));
        s.append(Message::user("q2"));
        s.append(Message::assistant("a2"));
        // Keeping the last turn puts the boundary at q2: the whole t1
        // exchange is summarized together, never split.
        let w = select_window_keeping(s.messages(), 1).unwrap();
        assert_eq!(w, 1..4);
    }

    #[test]
    fn aggressive_target_preserves_fewer_turns() {
        let s = seeded_store();
        // Without pressure the configured two turns survive.
        let relaxed = select_window(s.messages(), 2, &no_pressure(), 0.8).unwrap();
        assert_eq!(relaxed, 1..3);
        // Under a tight target the survivors of that split (~14 tokens)
        // exceed 0.5 × 20, so the window widens to keep only one turn.
        let tight = select_window(s.messages(), 2, &UsageTracker::new(20, 0), 0.5).unwrap();
        assert_eq!(tight, 1..5);
    }

    #[tokio::test]
    async fn compaction_replaces_window_with_labeled_summary() {
        let mut s = seeded_store();
        let before_len = s.len();
        let provider = ScriptedMockProvider::new(vec![ProviderScript::text("terse summary")]);

        let compactor = Compactor::new(1);
        let outcome = compactor
            .compact(&mut s, &provider, &no_pressure(), 0.8)
            .await
            .unwrap();

        assert!(outcome.summarized_by_model);
        assert_eq!(outcome.removed, 4);
        assert!(s.len() < before_len, "history length must strictly decrease");

        let summary = &s.messages()[1];
        assert_eq!(summary.role, Role::System);
        let text = summary.as_text().unwrap();
        assert!(text.contains(SUMMARY_NOTE_LABEL));
        assert!(text.contains("terse summary"));
        // Recent turn preserved verbatim.
        assert_eq!(s.messages()[2].as_text(), Some("recent question"));
    }

    #[tokio::test]
    async fn compaction_records_audit_metadata() {
        let mut s = seeded_store();
        let provider = ScriptedMockProvider::new(vec![ProviderScript::text("sum")]);
        Compactor::new(1)
            .compact(&mut s, &provider, &no_pressure(), 0.8)
            .await
            .unwrap();

        let meta = s.messages()[1].metadata.as_ref().unwrap();
        assert_eq!(meta["compaction"]["replaced"], 4);
        assert_eq!(meta["compaction"]["from"], 1);
        assert_eq!(meta["compaction"]["to"], 5);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_notice() {
        let mut s = seeded_store();
        let provider = ScriptedMockProvider::new(vec![ProviderScript::start_error(
            ProviderError::from_status(503, "unavailable"),
        )]);

        let outcome = Compactor::new(1)
            .compact(&mut s, &provider, &no_pressure(), 0.8)
            .await
            .unwrap();
        assert!(!outcome.summarized_by_model);
        assert!(outcome.tokens_after < outcome.tokens_before);
        let text = s.messages()[1].as_text().unwrap();
        assert!(text.contains(SUMMARY_NOTE_LABEL));
    }

    #[tokio::test]
    async fn nothing_to_compact_returns_none() {
        let mut s = MessageStore::new("s1");
        s.append(Message::system("sys"));
        s.append(Message::user("only question"));
        let provider = ScriptedMockProvider::always_text("unused");
        assert!(Compactor::new(4)
            .compact(&mut s, &provider, &no_pressure(), 0.8)
            .await
            .is_none());
    }
}
