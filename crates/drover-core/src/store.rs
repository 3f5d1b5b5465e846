// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ordered, append-only conversation history.
//!
//! The only permitted non-append operations are the compactor's range
//! replacement ([`MessageStore::compact_replace`]) and the caller-driven
//! [`MessageStore::replace_all`] while the runtime is idle.  The repair
//! pass ([`repair_turn`]) runs over the *accumulated* turn before anything
//! is appended, so history never contains a malformed tool exchange.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use drover_model::Message;
use drover_tools::ToolCall;

/// Conversation history for one session.
#[derive(Debug)]
pub struct MessageStore {
    session_id: String,
    messages: Vec<Message>,
    /// Approximate token total, maintained incrementally on append.
    token_count: usize,
}

impl MessageStore {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            token_count: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn append(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    /// Immutable copy for `get_context` snapshots and tool contexts.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Replace the whole history (`sync_messages`; idle-only at the caller).
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate();
    }

    /// Replace `range` with a single summary message.
    ///
    /// This is the one mutation of historical messages the invariants
    /// permit; callers record the provenance in the summary's metadata.
    /// Returns the number of messages removed.
    pub fn compact_replace(&mut self, range: std::ops::Range<usize>, summary: Message) -> usize {
        debug_assert!(range.start < range.end && range.end <= self.messages.len());
        let removed: Vec<Message> = self
            .messages
            .splice(range, std::iter::once(summary))
            .collect();
        self.recalculate();
        removed.len()
    }

    fn recalculate(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    // ── JSONL persistence ────────────────────────────────────────────────────

    /// Serialize as one JSON object per line: a header, then each message.
    pub fn to_jsonl(&self) -> String {
        let header = JsonlHeader {
            session_id: self.session_id.clone(),
            current_id: self.messages.len(),
            metadata: serde_json::json!({
                "saved_at": chrono::Utc::now().to_rfc3339(),
            }),
        };
        let mut out = serde_json::to_string(&header).expect("header serializes");
        for msg in &self.messages {
            out.push('\n');
            out.push_str(&serde_json::to_string(msg).expect("message serializes"));
        }
        out
    }

    pub fn from_jsonl(s: &str) -> anyhow::Result<Self> {
        let mut lines = s.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines.next().context("empty JSONL input")?;
        let header: JsonlHeader =
            serde_json::from_str(header_line).context("malformed JSONL header")?;
        let mut store = Self::new(header.session_id);
        for (i, line) in lines.enumerate() {
            let msg: Message = serde_json::from_str(line)
                .with_context(|| format!("malformed message at line {}", i + 2))?;
            store.append(msg);
        }
        Ok(store)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonlHeader {
    session_id: String,
    current_id: usize,
    #[serde(default)]
    metadata: serde_json::Value,
}

// ─── Turn repair ─────────────────────────────────────────────────────────────

/// A tool call as accumulated from stream deltas, before repair.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    /// Raw accumulated JSON argument text.
    pub arguments: String,
    /// Set when the provider dialect emitted an explicit terminator for
    /// this call.  Dialects without terminators leave every call unset.
    pub finished: bool,
}

/// One repaired call, ready for history.
#[derive(Debug, Clone)]
pub struct RepairedCall {
    pub call: ToolCall,
    /// A broken call is recorded in history but never executed; the
    /// runtime appends a synthesized error result in its place so the
    /// provider can recover on the next turn.
    pub broken: bool,
}

/// Result of the repair pass over one turn's accumulated tool calls.
#[derive(Debug, Default)]
pub struct RepairedTurn {
    pub calls: Vec<RepairedCall>,
    /// Number of partial calls dropped entirely (no stable id).
    pub dropped: usize,
}

/// Repair a turn's accumulated tool calls before they enter history.
///
/// - A call with no name cannot be dispatched and is dropped.
/// - When the dialect uses per-call terminators, a call that never got one
///   is incomplete: with a stable id it is kept as `broken` (a synthesized
///   error result will answer it); without an id it is dropped.
/// - Unparseable or empty arguments are replaced with `{}` so the history
///   sent back to the provider stays well-formed.
/// - A complete call with an empty id gets a synthetic one; rejecting the
///   whole turn over a missing id would waste the response.
pub fn repair_turn(mut pending: Vec<PendingToolCall>) -> RepairedTurn {
    pending.sort_by_key(|p| p.index);
    let uses_terminators = pending.iter().any(|p| p.finished);

    let mut turn = RepairedTurn::default();
    for (i, p) in pending.into_iter().enumerate() {
        if p.name.is_empty() {
            warn!(
                tool_call_id = %p.id,
                "dropping tool call with empty name from model; cannot dispatch"
            );
            turn.dropped += 1;
            continue;
        }

        let incomplete = uses_terminators && !p.finished;
        if incomplete && p.id.is_empty() {
            warn!(tool_name = %p.name, "dropping truncated tool call without a stable id");
            turn.dropped += 1;
            continue;
        }

        let args = if p.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&p.arguments) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_name = %p.name,
                        tool_call_id = %p.id,
                        error = %e,
                        "tool call has invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };

        let id = if p.id.is_empty() {
            let synthetic = format!("tc_synthetic_{i}");
            warn!(
                tool_name = %p.name,
                tool_call_id = %synthetic,
                "tool call from model had empty id; generated synthetic id"
            );
            synthetic
        } else {
            p.id
        };

        turn.calls.push(RepairedCall {
            call: ToolCall {
                id,
                name: p.name,
                args,
            },
            broken: incomplete,
        });
    }
    turn
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use drover_model::Role;

    fn pending(index: u32, id: &str, name: &str, args: &str, finished: bool) -> PendingToolCall {
        PendingToolCall {
            index,
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
            finished,
        }
    }

    // ── Append-only store ─────────────────────────────────────────────────────

    #[test]
    fn append_increments_token_count() {
        let mut s = MessageStore::new("s1");
        s.append(Message::user("12345678"));
        assert_eq!(s.token_count(), 2);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn snapshot_is_independent_of_later_appends() {
        let mut s = MessageStore::new("s1");
        s.append(Message::user("one"));
        let snap = s.snapshot();
        s.append(Message::user("two"));
        assert_eq!(snap.len(), 1);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn replace_all_recalculates_tokens() {
        let mut s = MessageStore::new("s1");
        s.append(Message::user("a long first message here"));
        s.replace_all(vec![Message::user("tiny")]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.token_count(), 1);
    }

    #[test]
    fn compact_replace_shrinks_history() {
        let mut s = MessageStore::new("s1");
        s.append(Message::system("sys"));
        s.append(Message::user("old one"));
        s.append(Message::assistant("old two"));
        s.append(Message::user("recent"));
        let removed = s.compact_replace(1..3, Message::system("[summary]"));
        assert_eq!(removed, 2);
        assert_eq!(s.len(), 3);
        assert_eq!(s.messages()[1].as_text(), Some("[summary]"));
        assert_eq!(s.messages()[2].as_text(), Some("recent"));
    }

    // ── JSONL ────────────────────────────────────────────────────────────────

    #[test]
    fn jsonl_round_trip_preserves_history() {
        let mut s = MessageStore::new("session-42");
        s.append(Message::user("hi"));
        s.append(Message::assistant("hello"));
        s.append(Message::tool_result("t1", "output"));

        let jsonl = s.to_jsonl();
        assert_eq!(jsonl.lines().count(), 4, "header + 3 messages");

        let back = MessageStore::from_jsonl(&jsonl).unwrap();
        assert_eq!(back.session_id(), "session-42");
        assert_eq!(back.len(), 3);
        assert_eq!(back.messages()[0].as_text(), Some("hi"));
        assert_eq!(back.messages()[2].role, Role::Tool);
    }

    #[test]
    fn jsonl_header_carries_session_and_count() {
        let mut s = MessageStore::new("sx");
        s.append(Message::user("m"));
        let first = s.to_jsonl().lines().next().unwrap().to_string();
        let v: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(v["session_id"], "sx");
        assert_eq!(v["current_id"], 1);
    }

    #[test]
    fn from_jsonl_rejects_garbage() {
        assert!(MessageStore::from_jsonl("").is_err());
        assert!(MessageStore::from_jsonl("not json").is_err());
    }

    // ── Repair pass ──────────────────────────────────────────────────────────

    #[test]
    fn repair_keeps_complete_calls_in_index_order() {
        let turn = repair_turn(vec![
            pending(1, "t2", "grep", r#"{"q":"x"}"#, false),
            pending(0, "t1", "echo", r#"{"text":"y"}"#, false),
        ]);
        assert_eq!(turn.calls.len(), 2);
        assert_eq!(turn.calls[0].call.id, "t1");
        assert_eq!(turn.calls[1].call.id, "t2");
        assert!(turn.calls.iter().all(|c| !c.broken));
    }

    #[test]
    fn repair_drops_nameless_calls() {
        let turn = repair_turn(vec![pending(0, "t1", "", "{}", false)]);
        assert!(turn.calls.is_empty());
        assert_eq!(turn.dropped, 1);
    }

    #[test]
    fn repair_marks_unterminated_call_with_id_as_broken() {
        // One call got its terminator, the other did not: the dialect uses
        // terminators, so the second call is incomplete.
        let turn = repair_turn(vec![
            pending(0, "t1", "echo", "{}", true),
            pending(1, "t2", "grep", r#"{"q":"#, false),
        ]);
        assert_eq!(turn.calls.len(), 2);
        assert!(!turn.calls[0].broken);
        assert!(turn.calls[1].broken, "unterminated call must not execute");
    }

    #[test]
    fn repair_drops_unterminated_call_without_id() {
        let turn = repair_turn(vec![
            pending(0, "t1", "echo", "{}", true),
            pending(1, "", "grep", "", false),
        ]);
        assert_eq!(turn.calls.len(), 1);
        assert_eq!(turn.dropped, 1);
    }

    #[test]
    fn repair_without_terminators_treats_all_as_complete() {
        let turn = repair_turn(vec![
            pending(0, "t1", "echo", "{}", false),
            pending(1, "t2", "grep", "{}", false),
        ]);
        assert_eq!(turn.calls.len(), 2);
        assert!(turn.calls.iter().all(|c| !c.broken));
    }

    #[test]
    fn repair_substitutes_empty_object_for_bad_arguments() {
        let turn = repair_turn(vec![pending(0, "t1", "echo", "{broken", false)]);
        assert_eq!(turn.calls[0].call.args, serde_json::json!({}));
    }

    #[test]
    fn repair_generates_synthetic_id_for_complete_idless_call() {
        let turn = repair_turn(vec![pending(0, "", "echo", "{}", false)]);
        assert_eq!(turn.calls.len(), 1);
        assert!(turn.calls[0].call.id.starts_with("tc_synthetic_"));
    }
}
