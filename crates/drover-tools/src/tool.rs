// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::ToolContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    /// Unique within one turn.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// What a tool execution produced.
///
/// `Effect` carries a structured value for tools whose result is a state
/// change rather than text; the runtime serialises it as JSON when the
/// result enters conversation history.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Ok(String),
    Error(String),
    Effect(Value),
}

/// The result of executing one tool call.  Exactly one exists per call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub outcome: ToolOutcome,
    pub elapsed: Duration,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Ok(content.into()),
            elapsed: Duration::ZERO,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Error(msg.into()),
            elapsed: Duration::ZERO,
        }
    }

    pub fn effect(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ToolOutcome::Effect(value),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Textual rendering of the outcome for conversation history.
    pub fn content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Ok(t) | ToolOutcome::Error(t) => t.clone(),
            ToolOutcome::Effect(v) => v.to_string(),
        }
    }
}

/// Trait that every tool capability must implement.
///
/// Tools never read runtime state directly; everything they may touch
/// arrives through [`ToolContext`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Execute the tool.  Failures should be reported as
    /// [`ToolOutcome::Error`], not panics.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
