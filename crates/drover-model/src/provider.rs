// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{CompletionRequest, Message, ProviderError, StreamEvent};

/// Stream of normalized provider events.  Cancellation is dropping the
/// stream (the runtime aborts the task that drains it).
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// A chat-completion backend.
///
/// Concrete HTTP clients live outside this crate; the runtime only needs
/// streaming, a non-streamed call for compaction summaries, and the model's
/// context window.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window of the configured model, in tokens.
    fn context_window(&self) -> usize {
        128_000
    }

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ProviderError>;

    /// Run one non-streamed turn and return the assistant message.
    ///
    /// Used by the compactor for summary generation.  The default
    /// implementation drains [`ChatProvider::stream`] and concatenates the
    /// text deltas; providers with a native non-streaming endpoint should
    /// override it.
    async fn one_shot(&self, req: CompletionRequest) -> Result<Message, ProviderError> {
        let mut stream = self
            .stream(CompletionRequest {
                stream: false,
                ..req
            })
            .await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => text.push_str(&delta),
                StreamEvent::Done => break,
                _ => {}
            }
        }
        Ok(Message::assistant(text))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedMockProvider;

    #[tokio::test]
    async fn default_one_shot_concatenates_text_deltas() {
        let p = ScriptedMockProvider::new(vec![crate::ProviderScript::events(vec![
            StreamEvent::TextDelta("hello ".into()),
            StreamEvent::TextDelta("world".into()),
            StreamEvent::Done,
        ])]);
        let msg = p.one_shot(CompletionRequest::default()).await.unwrap();
        assert_eq!(msg.as_text(), Some("hello world"));
    }

    #[tokio::test]
    async fn default_one_shot_propagates_stream_errors() {
        let p = ScriptedMockProvider::new(vec![crate::ProviderScript::start_error(
            ProviderError::fatal("no credits"),
        )]);
        assert!(p.one_shot(CompletionRequest::default()).await.is_err());
    }
}
