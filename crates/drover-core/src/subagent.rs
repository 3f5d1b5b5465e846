// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{AgentEvent, EventBus, Topic};

/// Republish a child runtime's events under the parent's session topic.
///
/// Sub-agents are independent runtimes: the parent subscribes to the
/// child's topic and wraps every envelope in [`AgentEvent::SubAgent`], so
/// parent subscribers see the child's lifecycle without subscribing to it
/// directly.  The bridge ends when the child topic closes; drop the handle
/// early to stop forwarding.
pub fn bridge_subagent(
    bus: Arc<EventBus>,
    parent_session: impl Into<String>,
    child_session: impl Into<String>,
) -> JoinHandle<()> {
    let parent = parent_session.into();
    let child = child_session.into();
    let mut rx = bus.subscribe(Topic::Session(child.clone()));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    bus.publish(
                        &parent,
                        AgentEvent::SubAgent {
                            session_id: envelope.session_id,
                            event: Box::new(envelope.event),
                        },
                    );
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(child = %child, "sub-agent bridge lagged {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
