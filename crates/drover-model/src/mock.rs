// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use crate::{ChatProvider, CompletionRequest, EventStream, ProviderError, StreamEvent};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<StreamEvent, ProviderError>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ProviderScript {
    /// The stream yields these events in order.
    Events(Vec<StreamEvent>),
    /// The stream yields these events, then fails with `error`.
    EventsThenError {
        events: Vec<StreamEvent>,
        error: ProviderError,
    },
    /// `stream()` itself fails before any event is produced.
    StartError(ProviderError),
}

impl ProviderScript {
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self::Events(events)
    }

    /// A plain text reply: delta, usage, done.
    pub fn text(reply: impl Into<String>) -> Self {
        Self::Events(vec![
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            StreamEvent::Done,
        ])
    }

    /// A single tool call, arguments delivered in one delta.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::Events(vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
            StreamEvent::Done,
        ])
    }

    pub fn start_error(error: ProviderError) -> Self {
        Self::StartError(error)
    }

    pub fn stream_error(events: Vec<StreamEvent>, error: ProviderError) -> Self {
        Self::EventsThenError { events, error }
    }
}

/// A pre-scripted mock provider.  Each call to `stream` pops the next
/// script from the front of the queue, so tests can specify exact event
/// sequences — including tool calls and injected failures — without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<ProviderScript>>>,
    name: String,
    context_window: usize,
    /// Pause inserted before each event, so tests can interleave commands
    /// (abort, queued prompts) with an in-flight stream.
    event_delay: Duration,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<ProviderScript>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            context_window: 128_000,
            event_delay: Duration::ZERO,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ProviderScript::text(reply)])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ProviderScript::tool_call(tool_id, tool_name, args_json),
            ProviderScript::text(final_text),
        ])
    }

    /// Insert a pause before every streamed event.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Number of scripts not yet consumed.
    pub fn remaining_scripts(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }
    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                ProviderScript::text("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };

        let items: Vec<Result<StreamEvent, ProviderError>> = match script {
            ProviderScript::StartError(e) => return Err(e),
            ProviderScript::Events(events) => events.into_iter().map(Ok).collect(),
            ProviderScript::EventsThenError { events, error } => events
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(error)))
                .collect(),
        };

        let delay = self.event_delay;
        if delay.is_zero() {
            Ok(Box::pin(stream::iter(items)))
        } else {
            Ok(Box::pin(stream::iter(items).then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
