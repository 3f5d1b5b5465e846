// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{ToolCall, ToolContext, ToolOutcome, ToolOutput, ToolRegistry};

/// Lifecycle notifications for one batch.  The runtime maps these onto its
/// `tool_start` / `tool_end` bus events.
#[derive(Debug, Clone)]
pub enum ToolProgress {
    Started {
        call_id: String,
        name: String,
    },
    Finished {
        call_id: String,
        name: String,
        is_error: bool,
        elapsed: Duration,
    },
}

/// Executes one batch of tool calls concurrently.
///
/// Each call runs as an independent task: a panic or timeout in one call
/// becomes an error output for that call and never affects its siblings or
/// the runtime.  Outputs are collected in **input order** regardless of
/// completion order — the only synchronization point in the fan-in.
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Run `calls` to completion, or until `cancel` fires.
    ///
    /// Returns `None` when cancelled: all still-running tasks are aborted
    /// and partial results are discarded.  A dropped cancel sender counts
    /// as cancellation, so the caller must hold it for the batch lifetime.
    pub async fn run_batch(
        &self,
        calls: Vec<ToolCall>,
        ctx: ToolContext,
        progress: mpsc::Sender<ToolProgress>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Option<Vec<ToolOutput>> {
        let mut handles = Vec::with_capacity(calls.len());
        for call in &calls {
            let registry = Arc::clone(&self.registry);
            let call = call.clone();
            let call_ctx = ctx.for_call(&call.id);
            let timeout = self.timeout;
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                let _ = progress
                    .send(ToolProgress::Started {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                    })
                    .await;
                let start = Instant::now();
                let outcome = match registry.get(&call.name) {
                    None => ToolOutcome::Error(format!("unknown tool: {}", call.name)),
                    Some(tool) => {
                        match tokio::time::timeout(timeout, tool.execute(call.args.clone(), &call_ctx))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => {
                                warn!(call_id = %call.id, tool = %call.name, "tool timed out");
                                ToolOutcome::Error(format!(
                                    "tool timed out after {}s",
                                    timeout.as_secs()
                                ))
                            }
                        }
                    }
                };
                let elapsed = start.elapsed();
                let _ = progress
                    .send(ToolProgress::Finished {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        is_error: matches!(outcome, ToolOutcome::Error(_)),
                        elapsed,
                    })
                    .await;
                ToolOutput {
                    call_id: call.id,
                    outcome,
                    elapsed,
                }
            }));
        }

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        // Await tasks in input order so the output vector matches the order
        // the provider listed the calls, regardless of completion order.
        let collect = async move {
            let mut outputs = Vec::with_capacity(handles.len());
            for (i, handle) in handles.into_iter().enumerate() {
                let out = match handle.await {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(call_id = %calls[i].id, tool = %calls[i].name, "tool task crashed: {e}");
                        let _ = progress
                            .send(ToolProgress::Finished {
                                call_id: calls[i].id.clone(),
                                name: calls[i].name.clone(),
                                is_error: true,
                                elapsed: Duration::ZERO,
                            })
                            .await;
                        ToolOutput::err(&calls[i].id, format!("tool crashed: {e}"))
                    }
                };
                outputs.push(out);
            }
            outputs
        };
        tokio::pin!(collect);

        tokio::select! {
            biased;
            _ = &mut cancel => {
                for h in &abort_handles {
                    h.abort();
                }
                None
            }
            outputs = &mut collect => Some(outputs),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
