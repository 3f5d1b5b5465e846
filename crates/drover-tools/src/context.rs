// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Execution context handed to tools.
//!
//! Tools hold opaque handles only: an immutable snapshot of the runtime's
//! state and an emit channel back to it.  They never read runtime state
//! directly, so a slow or misbehaving tool cannot observe or block the
//! state machine.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use drover_config::RuntimeConfig;

/// Immutable snapshot of the runtime at tool-dispatch time.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Name of the state-machine phase when the batch was dispatched.
    pub phase: String,
    /// Number of messages in conversation history at dispatch.
    pub message_count: usize,
}

/// A notification a tool posts back to the runtime mid-execution.
/// The runtime drains these and republishes them on its event bus.
#[derive(Debug, Clone)]
pub struct ToolNotice {
    pub call_id: String,
    pub payload: Value,
}

/// Everything a tool may touch during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    pub config: Arc<RuntimeConfig>,
    pub agent_state: StateSnapshot,
    /// Channel for mid-execution notices; see [`ToolContext::emit`].
    pub notices: mpsc::Sender<ToolNotice>,
    /// Id of the call this context was built for.
    pub call_id: String,
}

impl ToolContext {
    /// Post a notice back to the runtime.  Best-effort: a full or closed
    /// channel drops the notice rather than blocking the tool.
    pub fn emit(&self, payload: Value) {
        let _ = self.notices.try_send(ToolNotice {
            call_id: self.call_id.clone(),
            payload,
        });
    }

    /// Derive a per-call context from a batch-level one.
    pub fn for_call(&self, call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ..self.clone()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx(notices: mpsc::Sender<ToolNotice>) -> ToolContext {
        ToolContext {
            working_dir: PathBuf::from("."),
            session_id: "s1".into(),
            config: Arc::new(RuntimeConfig::default()),
            agent_state: StateSnapshot {
                phase: "executing_tools".into(),
                message_count: 3,
            },
            notices,
            call_id: String::new(),
        }
    }

    #[tokio::test]
    async fn emit_delivers_notice_with_call_id() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = base_ctx(tx).for_call("t1");
        ctx.emit(serde_json::json!({"progress": 0.5}));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.call_id, "t1");
        assert_eq!(notice.payload["progress"], 0.5);
    }

    #[tokio::test]
    async fn emit_on_closed_channel_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = base_ctx(tx).for_call("t1");
        ctx.emit(serde_json::json!({}));
    }

    #[test]
    fn for_call_substitutes_only_the_call_id() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = base_ctx(tx);
        let derived = ctx.for_call("abc");
        assert_eq!(derived.call_id, "abc");
        assert_eq!(derived.session_id, ctx.session_id);
    }
}
