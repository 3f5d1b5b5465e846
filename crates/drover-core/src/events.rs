// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Lifecycle events published by the runtime during a session.
/// Consumers subscribe through the [`crate::EventBus`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A user prompt was accepted and a run began
    AgentStart,
    /// The run finished and the runtime is about to hand off
    AgentEnd,
    /// The run was cancelled by the caller
    AgentAbort,
    /// The assistant response started (first text delta of a turn)
    MessageStart,
    /// A text chunk streamed from the model
    MessageDelta(String),
    /// The assistant message was finalized and appended to history
    MessageEnd(String),
    /// The model started a reasoning block
    ThinkingStart,
    /// A reasoning chunk; forwarded to subscribers, never persisted
    ThinkingDelta(String),
    /// A tool invocation was dispatched
    ToolStart { call_id: String, name: String },
    /// A tool invocation finished
    ToolEnd {
        call_id: String,
        name: String,
        is_error: bool,
        elapsed_ms: u64,
    },
    /// A provider request was opened (attempt is 0-based)
    RequestStart { attempt: u32 },
    /// The provider response was fully consumed
    RequestEnd,
    /// Token usage update for the current turn
    UsageUpdate {
        input_tokens: u32,
        output_tokens: u32,
        /// Estimated tokens of the conversation history
        context_tokens: usize,
        context_window: usize,
    },
    /// A mid-execution notification emitted by a running tool through its
    /// context's emit handle
    ToolNote {
        call_id: String,
        payload: serde_json::Value,
    },
    /// A fatal error ended the run, or a repair pass dropped malformed data
    Error(String),
    /// An event republished from a child runtime's session
    SubAgent {
        session_id: String,
        event: Box<AgentEvent>,
    },
}

/// One published event together with the session it belongs to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session_id: String,
    pub event: AgentEvent,
}
