// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// A single normalized event decoded from a provider stream.
///
/// Providers differ in wire format; the decoder reduces every dialect to
/// this set.  Delivery order matches frame order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text chunk of the assistant response.
    TextDelta(String),
    /// A reasoning chunk.  Forwarded to subscribers, never persisted.
    ThinkingDelta(String),
    /// Part of a tool invocation request.  Chunks for one call share an
    /// `index`; `id`/`name` arrive once (possibly empty on later chunks)
    /// while `arguments` accumulates across chunks.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The provider closed the tool call at `index`.  Emitted by dialects
    /// with explicit block terminators; dialects without one rely on a
    /// clean `Done` to mark all pending calls complete.
    ToolCallDone { index: u32 },
    /// Token usage statistics for the turn.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// The response finished normally.
    Done,
}
