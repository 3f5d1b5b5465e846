// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent runtime: a four-state machine driving one conversational
//! session against a model provider.
//!
//! # Design
//!
//! ```text
//!   caller ──► AgentHandle ──► mpsc::Sender<Inbound> ──► AgentRuntime
//!                                                            │
//!   stream pump task ──► Inbound::StreamEvent/Closed ◄───────┤ owns all state
//!   tool batch task  ──► Inbound::ToolsDone          ◄───────┤ one msg at a time
//!   retry timer task ──► Inbound::RetryFire          ◄───────┘
//!                                                            │
//!   subscribers ◄── EventBus::publish(session_id, event) ◄───┘
//! ```
//!
//! One logical executor owns `RuntimeState`: every input — caller command,
//! stream event, tool completion, timer — arrives through a single inbox
//! and is processed strictly one at a time.  Provider I/O and tools run on
//! spawned tasks that only post messages back, so the runtime never blocks
//! on the network and event latency stays bounded regardless of slow tools
//! or streams.
//!
//! Internal messages carry the generation counter of the turn that spawned
//! them; a bump of the counter (finalization, retry, abort) makes every
//! stale message from a cancelled task fall through harmlessly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drover_config::RuntimeConfig;
use drover_model::{
    ChatProvider, CompletionRequest, EventStream, Message, ProviderError, StreamEvent, ToolSchema,
};
use drover_tools::{
    StateSnapshot, ToolCall, ToolContext, ToolNotice, ToolOutput, ToolProgress, ToolRegistry,
    ToolRunner,
};

use crate::compact::Compactor;
use crate::retry::{backoff_delay, classify, max_attempts_for, ErrorClass};
use crate::store::{repair_turn, MessageStore, PendingToolCall, RepairedCall};
use crate::usage::UsageTracker;
use crate::{AgentEvent, Envelope, EventBus, Topic};

/// The controlling state of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Streaming,
    ExecutingTools,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Streaming => "streaming",
            Phase::ExecutingTools => "executing_tools",
        }
    }
}

/// Errors surfaced through the caller-facing handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The operation is only valid while the runtime is idle.
    #[error("runtime is busy")]
    Busy,
    /// The runtime task is gone.
    #[error("runtime has shut down")]
    ShutDown,
}

/// Everything that can arrive in the runtime's inbox: caller commands and
/// completion messages posted back by spawned worker tasks.
enum Inbound {
    Prompt {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Abort {
        reply: oneshot::Sender<()>,
    },
    GetPhase {
        reply: oneshot::Sender<Phase>,
    },
    GetContext {
        reply: oneshot::Sender<Vec<Message>>,
    },
    SetModel {
        model: String,
    },
    SetProvider {
        provider: Arc<dyn ChatProvider>,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    SyncMessages {
        messages: Vec<Message>,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Configure {
        enabled_tools: Option<Vec<String>>,
        features: HashMap<String, bool>,
    },
    StreamEvent {
        turn_gen: u64,
        event: StreamEvent,
    },
    StreamClosed {
        turn_gen: u64,
        error: Option<ProviderError>,
    },
    ToolsDone {
        turn_gen: u64,
        outputs: Option<Vec<ToolOutput>>,
    },
    RetryFire {
        turn_gen: u64,
        attempt: u32,
    },
    Notice(ToolNotice),
}

/// Accumulator for the provider turn currently in flight.
struct TurnState {
    assistant_accum: String,
    message_started: bool,
    thinking_started: bool,
    /// Tool calls merged from deltas, keyed by the provider's index.
    pending: HashMap<u32, PendingToolCall>,
    usage_in: u32,
    usage_out: u32,
    attempt: u32,
    started_at: Instant,
}

impl TurnState {
    fn new(attempt: u32) -> Self {
        Self {
            assistant_accum: String::new(),
            message_started: false,
            thinking_started: false,
            pending: HashMap::new(),
            usage_in: 0,
            usage_out: 0,
            attempt,
            started_at: Instant::now(),
        }
    }
}

/// State of the tool batch currently executing.
struct ExecState {
    /// All repaired calls in provider order, runnable and broken alike.
    calls: Vec<RepairedCall>,
    /// Held for the batch lifetime; dropping it (or sending) cancels the
    /// batch, so it must live here until the batch posts its completion.
    cancel: oneshot::Sender<()>,
}

/// Cheap-to-clone handle to a running [`AgentRuntime`].
#[derive(Clone)]
pub struct AgentHandle {
    session_id: String,
    tx: mpsc::Sender<Inbound>,
    bus: Arc<EventBus>,
}

impl AgentHandle {
    /// Submit a prompt.  Returns `false` when it was accepted immediately
    /// (runtime was idle), `true` when it was queued behind a running turn.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<bool, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Prompt {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Cancel the current run and return to idle.  Idempotent.
    pub async fn abort(&self) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Abort { reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Non-blocking snapshot of the current phase.
    pub async fn phase(&self) -> Result<Phase, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::GetPhase { reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Immutable snapshot of conversation history.
    pub async fn context(&self) -> Result<Vec<Message>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::GetContext { reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)
    }

    /// Switch models.  Applies from the next turn; valid in any state.
    pub async fn set_model(&self, model: impl Into<String>) -> Result<(), RuntimeError> {
        self.tx
            .send(Inbound::SetModel {
                model: model.into(),
            })
            .await
            .map_err(|_| RuntimeError::ShutDown)
    }

    /// Swap the provider.  Only valid while idle.
    pub async fn set_provider(
        &self,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::SetProvider { provider, reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)?
    }

    /// Replace conversation history.  Only valid while idle.
    pub async fn sync_messages(&self, messages: Vec<Message>) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::SyncMessages { messages, reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        rx.await.map_err(|_| RuntimeError::ShutDown)?
    }

    /// Update the enabled tool set and feature switches.  Applies from the
    /// next turn; valid in any state.
    pub async fn configure(
        &self,
        enabled_tools: Option<Vec<String>>,
        features: HashMap<String, bool>,
    ) -> Result<(), RuntimeError> {
        self.tx
            .send(Inbound::Configure {
                enabled_tools,
                features,
            })
            .await
            .map_err(|_| RuntimeError::ShutDown)
    }

    /// Subscribe to this session's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe(Topic::Session(self.session_id.clone()))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

/// The per-session coordinator.  Construct with [`AgentRuntime::new`] and
/// drive with [`AgentRuntime::run`], or use [`AgentRuntime::spawn`].
pub struct AgentRuntime {
    session_id: String,
    config: RuntimeConfig,
    provider: Arc<dyn ChatProvider>,
    model: String,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,

    store: MessageStore,
    pending_prompts: VecDeque<String>,
    phase: Phase,
    turn: Option<TurnState>,
    exec: Option<ExecState>,

    stream_task: Option<JoinHandle<()>>,
    tools_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    /// One compaction pass per overflow rejection; a second rejection after
    /// compacting is fatal rather than a loop.
    overflow_retry_used: bool,
    turn_gen: u64,

    inbox_rx: mpsc::Receiver<Inbound>,
    /// Weak so the runtime exits when every handle and worker is gone.
    inbox: mpsc::WeakSender<Inbound>,
    notices_tx: mpsc::Sender<ToolNotice>,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        config: RuntimeConfig,
        bus: Arc<EventBus>,
    ) -> (Self, AgentHandle) {
        let session_id = Uuid::new_v4().to_string();
        // Deep enough to absorb bursts from a fast stream without ever
        // making the pump wait on the inbox.
        let (tx, rx) = mpsc::channel(256);
        let (notices_tx, notices_rx) = mpsc::channel(64);

        let handle = AgentHandle {
            session_id: session_id.clone(),
            tx: tx.clone(),
            bus: Arc::clone(&bus),
        };

        // Forward tool notices into the inbox so they are serialized with
        // everything else.  The forwarder holds only a weak sender: it must
        // not keep the runtime alive on its own.
        let weak = tx.downgrade();
        let notice_inbox = tx.downgrade();
        tokio::spawn(async move {
            let mut notices_rx = notices_rx;
            while let Some(notice) = notices_rx.recv().await {
                let Some(inbox) = notice_inbox.upgrade() else {
                    break;
                };
                let _ = inbox.send(Inbound::Notice(notice)).await;
            }
        });
        drop(tx);

        let model = provider.model_name().to_string();
        let runtime = Self {
            store: MessageStore::new(session_id.clone()),
            session_id,
            config,
            provider,
            model,
            registry,
            bus,
            pending_prompts: VecDeque::new(),
            phase: Phase::Idle,
            turn: None,
            exec: None,
            stream_task: None,
            tools_task: None,
            retry_task: None,
            overflow_retry_used: false,
            turn_gen: 0,
            inbox_rx: rx,
            inbox: weak,
            notices_tx,
        };
        (runtime, handle)
    }

    /// Construct and spawn onto the current tokio runtime.
    pub fn spawn(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        config: RuntimeConfig,
        bus: Arc<EventBus>,
    ) -> AgentHandle {
        let (runtime, handle) = Self::new(provider, registry, config, bus);
        tokio::spawn(runtime.run());
        handle
    }

    /// Run the inbox loop.  Returns when every handle has been dropped and
    /// no worker task holds a sender.
    pub async fn run(mut self) {
        info!(session_id = %self.session_id, "agent runtime started");
        while let Some(msg) = self.inbox_rx.recv().await {
            self.handle_inbound(msg).await;
        }
        // Teardown: nothing may outlive the session.
        self.cancel_workers();
        info!(session_id = %self.session_id, "agent runtime stopped");
    }

    async fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Prompt { text, reply } => {
                if self.phase == Phase::Idle {
                    let _ = reply.send(false);
                    self.accept_prompt(text).await;
                } else {
                    // A prompt never interrupts the current turn; it waits
                    // for the hand-off back to idle.
                    self.pending_prompts.push_back(text);
                    let _ = reply.send(true);
                }
            }
            Inbound::Abort { reply } => {
                self.do_abort();
                let _ = reply.send(());
            }
            Inbound::GetPhase { reply } => {
                let _ = reply.send(self.phase);
            }
            Inbound::GetContext { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
            Inbound::SetModel { model } => {
                debug!(session_id = %self.session_id, %model, "model updated for next turn");
                self.model = model;
            }
            Inbound::SetProvider { provider, reply } => {
                if self.phase == Phase::Idle {
                    self.model = provider.model_name().to_string();
                    self.provider = provider;
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(RuntimeError::Busy));
                }
            }
            Inbound::SyncMessages { messages, reply } => {
                if self.phase == Phase::Idle {
                    self.store.replace_all(messages);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(RuntimeError::Busy));
                }
            }
            Inbound::Configure {
                enabled_tools,
                features,
            } => {
                self.config.enabled_tools = enabled_tools;
                self.config.features = features;
            }
            Inbound::StreamEvent { turn_gen, event } => {
                if turn_gen == self.turn_gen {
                    self.on_stream_event(event).await;
                }
            }
            Inbound::StreamClosed { turn_gen, error } => {
                if turn_gen == self.turn_gen {
                    self.on_stream_closed(error).await;
                }
            }
            Inbound::ToolsDone { turn_gen, outputs } => {
                if turn_gen == self.turn_gen {
                    self.on_tools_done(outputs).await;
                }
            }
            Inbound::RetryFire { turn_gen, attempt } => {
                if turn_gen == self.turn_gen {
                    self.retry_task = None;
                    self.start_turn(attempt).await;
                }
            }
            Inbound::Notice(notice) => {
                self.publish(AgentEvent::ToolNote {
                    call_id: notice.call_id,
                    payload: notice.payload,
                });
            }
        }
    }

    // ── Intake ───────────────────────────────────────────────────────────────

    async fn accept_prompt(&mut self, text: String) {
        if self.store.is_empty() {
            let prompt = crate::prompts::system_prompt(self.config.system_prompt.as_deref());
            self.store.append(Message::system(prompt));
        }
        self.store.append(Message::user(text));
        self.publish(AgentEvent::AgentStart);
        self.overflow_retry_used = false;
        self.start_turn(0).await;
    }

    // ── Turn lifecycle ───────────────────────────────────────────────────────

    /// Entry action of the `running` state: compaction gate, request
    /// assembly, stream open.
    async fn start_turn(&mut self, attempt: u32) {
        self.phase = Phase::Running;

        let tracker = self.usage_tracker();
        if tracker.needs_compaction(self.store.messages(), self.config.compaction.threshold) {
            self.run_compaction(self.config.compaction.threshold).await;
        }

        let tools: Vec<ToolSchema> = self
            .registry
            .schemas_filtered(self.config.enabled_tools.as_deref())
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let req = CompletionRequest {
            messages: self.store.snapshot(),
            tools,
            stream: true,
            model: Some(self.model.clone()),
        };

        self.publish(AgentEvent::RequestStart { attempt });
        match self.provider.stream(req).await {
            Ok(stream) => {
                self.turn_gen += 1;
                self.turn = Some(TurnState::new(attempt));
                let Some(inbox) = self.inbox.upgrade() else {
                    return;
                };
                let idle = Duration::from_secs(self.config.timeouts.stream_idle_secs);
                self.stream_task = Some(tokio::spawn(pump_stream(
                    stream,
                    inbox,
                    self.turn_gen,
                    idle,
                )));
                self.phase = Phase::Streaming;
            }
            Err(e) => self.handle_provider_error(e, attempt).await,
        }
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return;
                }
                let first = {
                    let Some(turn) = self.turn.as_mut() else { return };
                    let first = !turn.message_started;
                    turn.message_started = true;
                    turn.assistant_accum.push_str(&delta);
                    first
                };
                if first {
                    self.publish(AgentEvent::MessageStart);
                }
                self.publish(AgentEvent::MessageDelta(delta));
            }
            StreamEvent::ThinkingDelta(delta) => {
                let first = {
                    let Some(turn) = self.turn.as_mut() else { return };
                    let first = !turn.thinking_started;
                    turn.thinking_started = true;
                    first
                };
                if first {
                    self.publish(AgentEvent::ThinkingStart);
                }
                // Thinking is forwarded to subscribers but never persisted.
                self.publish(AgentEvent::ThinkingDelta(delta));
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let Some(turn) = self.turn.as_mut() else { return };
                let entry = turn.pending.entry(index).or_insert_with(|| PendingToolCall {
                    index,
                    ..PendingToolCall::default()
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.arguments.push_str(&arguments);
            }
            StreamEvent::ToolCallDone { index } => {
                let Some(turn) = self.turn.as_mut() else { return };
                if let Some(entry) = turn.pending.get_mut(&index) {
                    entry.finished = true;
                }
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                {
                    let Some(turn) = self.turn.as_mut() else { return };
                    turn.usage_in = input_tokens;
                    turn.usage_out = output_tokens;
                }
                let context_tokens = self.store.token_count();
                let context_window = self.context_window();
                self.publish(AgentEvent::UsageUpdate {
                    input_tokens,
                    output_tokens,
                    context_tokens,
                    context_window,
                });
            }
            StreamEvent::Done => self.finalize_turn().await,
        }
    }

    async fn on_stream_closed(&mut self, error: Option<ProviderError>) {
        // A clean close is handled at the Done event, which bumps the
        // generation; reaching here means the stream ended abnormally.
        let error =
            error.unwrap_or_else(|| ProviderError::network("stream ended before completion"));
        let attempt = self.turn.as_ref().map(|t| t.attempt).unwrap_or(0);
        self.handle_provider_error(error, attempt).await;
    }

    /// `response_done`: repair the accumulated turn, append it to history,
    /// and either dispatch tools or hand off.
    async fn finalize_turn(&mut self) {
        self.turn_gen += 1;
        if let Some(h) = self.stream_task.take() {
            h.abort();
        }
        self.publish(AgentEvent::RequestEnd);

        let Some(turn) = self.turn.take() else {
            self.phase = Phase::Idle;
            return;
        };
        debug!(
            session_id = %self.session_id,
            elapsed_ms = turn.started_at.elapsed().as_millis() as u64,
            attempt = turn.attempt,
            input_tokens = turn.usage_in,
            output_tokens = turn.usage_out,
            "provider turn finalized"
        );

        if !turn.assistant_accum.is_empty() {
            self.store.append(Message::assistant(&turn.assistant_accum));
            self.publish(AgentEvent::MessageEnd(turn.assistant_accum));
        }

        let pending: Vec<PendingToolCall> = turn.pending.into_values().collect();
        let repaired = repair_turn(pending);
        if repaired.dropped > 0 {
            self.publish(AgentEvent::Error(format!(
                "dropped {} malformed tool call(s) from the response",
                repaired.dropped
            )));
        }

        if repaired.calls.is_empty() {
            self.hand_off().await;
            return;
        }

        // Tool-call messages precede every result, in provider order.
        for rc in &repaired.calls {
            self.store.append(Message::tool_call(
                &rc.call.id,
                &rc.call.name,
                rc.call.args.to_string(),
            ));
        }
        self.dispatch_tools(repaired.calls).await;
    }

    /// Start the tool batch for this turn's calls.
    async fn dispatch_tools(&mut self, calls: Vec<RepairedCall>) {
        self.phase = Phase::ExecutingTools;

        let runnable: Vec<ToolCall> = calls
            .iter()
            .filter(|c| !c.broken)
            .map(|c| c.call.clone())
            .collect();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.exec = Some(ExecState {
            calls,
            cancel: cancel_tx,
        });

        if runnable.is_empty() {
            // Nothing to execute; synthesized results answer every call.
            self.merge_tool_outputs(Vec::new()).await;
            return;
        }

        // Bridge tool lifecycle notifications straight onto the bus; they
        // carry no runtime state, so no inbox round-trip is needed.
        let (progress_tx, mut progress_rx) = mpsc::channel::<ToolProgress>(64);
        let bus = Arc::clone(&self.bus);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            while let Some(p) = progress_rx.recv().await {
                let event = match p {
                    ToolProgress::Started { call_id, name } => {
                        AgentEvent::ToolStart { call_id, name }
                    }
                    ToolProgress::Finished {
                        call_id,
                        name,
                        is_error,
                        elapsed,
                    } => AgentEvent::ToolEnd {
                        call_id,
                        name,
                        is_error,
                        elapsed_ms: elapsed.as_millis() as u64,
                    },
                };
                bus.publish(&session_id, event);
            }
        });

        let ctx = ToolContext {
            working_dir: self
                .config
                .working_dir
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| ".".into()),
            session_id: self.session_id.clone(),
            config: Arc::new(self.config.clone()),
            agent_state: StateSnapshot {
                phase: self.phase.name().to_string(),
                message_count: self.store.len(),
            },
            notices: self.notices_tx.clone(),
            call_id: String::new(),
        };

        let runner = ToolRunner::new(
            Arc::clone(&self.registry),
            Duration::from_secs(self.config.timeouts.tool_secs),
        );
        let turn_gen = self.turn_gen;
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        self.tools_task = Some(tokio::spawn(async move {
            let outputs = runner.run_batch(runnable, ctx, progress_tx, cancel_rx).await;
            let _ = inbox.send(Inbound::ToolsDone { turn_gen, outputs }).await;
        }));
    }

    async fn on_tools_done(&mut self, outputs: Option<Vec<ToolOutput>>) {
        self.tools_task = None;
        match outputs {
            Some(outputs) => self.merge_tool_outputs(outputs).await,
            // A cancelled batch is only reachable through abort, which has
            // already reset the state; nothing to do.
            None => {}
        }
    }

    /// Append one result per call in provider order, then start the next
    /// provider turn.
    async fn merge_tool_outputs(&mut self, outputs: Vec<ToolOutput>) {
        let Some(exec) = self.exec.take() else { return };

        let mut by_id: HashMap<String, ToolOutput> = outputs
            .into_iter()
            .map(|o| (o.call_id.clone(), o))
            .collect();

        for rc in &exec.calls {
            let content = if rc.broken {
                "tool call was interrupted before its arguments completed; \
                 no result is available"
                    .to_string()
            } else {
                match by_id.remove(&rc.call.id) {
                    Some(output) => output.content(),
                    None => "tool produced no result".to_string(),
                }
            };
            self.store.append(Message::tool_result(&rc.call.id, content));
        }

        self.overflow_retry_used = false;
        self.start_turn(0).await;
    }

    /// Hand-off after a turn with no tool calls: drain one queued prompt or
    /// go idle.
    async fn hand_off(&mut self) {
        self.publish(AgentEvent::AgentEnd);
        self.exec = None;
        if let Some(next) = self.pending_prompts.pop_front() {
            self.store.append(Message::user(next));
            self.publish(AgentEvent::AgentStart);
            self.overflow_retry_used = false;
            self.start_turn(0).await;
        } else {
            self.phase = Phase::Idle;
            self.turn = None;
        }
    }

    // ── Failure handling ─────────────────────────────────────────────────────

    async fn handle_provider_error(&mut self, error: ProviderError, attempt: u32) {
        self.turn_gen += 1;
        if let Some(h) = self.stream_task.take() {
            h.abort();
        }
        // Any partial accumulation from the failed stream is discarded.
        self.turn = None;

        match classify(&error) {
            ErrorClass::Overflow => {
                if self.overflow_retry_used {
                    self.fail_fatal(format!(
                        "context overflow persisted after compaction: {error}"
                    ));
                    return;
                }
                warn!(session_id = %self.session_id, "provider rejected request for size; compacting");
                self.overflow_retry_used = true;
                // The forced pass aims below the normal trigger so the
                // retried request has real headroom, not a sliver.
                let target = self.config.compaction.overflow_threshold;
                if self.run_compaction(target).await {
                    self.schedule_retry(0, Duration::ZERO);
                } else {
                    self.fail_fatal(format!(
                        "context overflow with nothing left to compact: {error}"
                    ));
                }
            }
            ErrorClass::Transient => {
                let allowed = max_attempts_for(&error, &self.config.retry);
                if attempt >= allowed {
                    self.fail_fatal(format!(
                        "provider error persisted after {attempt} retries: {error}"
                    ));
                    return;
                }
                let delay = backoff_delay(attempt, &self.config.retry);
                warn!(
                    session_id = %self.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error; retrying: {error}"
                );
                self.schedule_retry(attempt + 1, delay);
            }
            ErrorClass::Fatal => self.fail_fatal(error.to_string()),
        }
    }

    /// Backoff state: the runtime sits in `running` with only the timer
    /// live; a new prompt queues normally and abort cancels the timer.
    fn schedule_retry(&mut self, attempt: u32, delay: Duration) {
        self.phase = Phase::Running;
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let turn_gen = self.turn_gen;
        self.retry_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = inbox.send(Inbound::RetryFire { turn_gen, attempt }).await;
        }));
    }

    fn fail_fatal(&mut self, message: String) {
        error!(session_id = %self.session_id, "{message}");
        self.turn_gen += 1;
        self.cancel_workers();
        self.turn = None;
        self.exec = None;
        self.phase = Phase::Idle;
        self.publish(AgentEvent::Error(message));
        if !self.config.preserve_queued_on_error {
            let dropped = self.pending_prompts.len();
            self.pending_prompts.clear();
            if dropped > 0 {
                self.publish(AgentEvent::Error(format!(
                    "discarded {dropped} queued prompt(s) after fatal error"
                )));
            }
        }
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Cooperative, transitive, idempotent abort: stream, tools, and timer
    /// are all cancelled, partial state is discarded, and the runtime
    /// returns to idle.  Queued prompts are preserved.
    fn do_abort(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        self.turn_gen += 1;
        // Tool calls already recorded in history must be answered before
        // any future assistant message; the batch's real results are
        // discarded, so answer them with a synthetic abort marker.
        if let Some(exec) = &self.exec {
            for rc in &exec.calls {
                self.store
                    .append(Message::tool_result(&rc.call.id, "tool execution was aborted"));
            }
        }
        self.cancel_workers();
        self.turn = None;
        self.phase = Phase::Idle;
        self.publish(AgentEvent::AgentAbort);
    }

    fn cancel_workers(&mut self) {
        if let Some(h) = self.stream_task.take() {
            h.abort();
        }
        if let Some(exec) = self.exec.take() {
            // The runner aborts its children on cancel; the batch task then
            // posts a stale completion that the generation bump discards.
            let _ = exec.cancel.send(());
        }
        self.tools_task = None;
        if let Some(h) = self.retry_task.take() {
            h.abort();
        }
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Run one compaction pass toward `target` (the fraction of the
    /// context window the surviving history may occupy).  Returns true
    /// when history shrank.
    async fn run_compaction(&mut self, target: f32) -> bool {
        let tracker = self.usage_tracker();
        let compactor = Compactor::new(self.config.compaction.keep_recent_turns);
        let outcome = compactor
            .compact(&mut self.store, self.provider.as_ref(), &tracker, target)
            .await;
        match outcome {
            Some(outcome) => {
                info!(
                    session_id = %self.session_id,
                    removed = outcome.removed,
                    tokens_before = outcome.tokens_before,
                    tokens_after = outcome.tokens_after,
                    "history compacted"
                );
                let context_tokens = self.store.token_count();
                let context_window = self.context_window();
                self.publish(AgentEvent::UsageUpdate {
                    input_tokens: 0,
                    output_tokens: 0,
                    context_tokens,
                    context_window,
                });
                true
            }
            None => false,
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn usage_tracker(&self) -> UsageTracker {
        UsageTracker::new(self.context_window(), self.config.message_overhead_tokens)
    }

    fn context_window(&self) -> usize {
        match self.provider.context_window() {
            0 => self.config.context_window,
            w => w,
        }
    }

    fn publish(&self, event: AgentEvent) {
        self.bus.publish(&self.session_id, event);
    }
}

/// Drain the provider stream into the inbox, applying the idle watchdog.
///
/// Runs off the runtime's logical thread; the runtime never awaits network
/// I/O directly.
async fn pump_stream(
    mut stream: EventStream,
    inbox: mpsc::Sender<Inbound>,
    turn_gen: u64,
    idle: Duration,
) {
    use futures::StreamExt;
    loop {
        match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                let _ = inbox
                    .send(Inbound::StreamClosed {
                        turn_gen,
                        error: Some(ProviderError::StreamIdle),
                    })
                    .await;
                return;
            }
            Ok(None) => {
                let _ = inbox
                    .send(Inbound::StreamClosed {
                        turn_gen,
                        error: Some(ProviderError::network("stream ended before completion")),
                    })
                    .await;
                return;
            }
            Ok(Some(Ok(event))) => {
                let done = matches!(event, StreamEvent::Done);
                if inbox
                    .send(Inbound::StreamEvent { turn_gen, event })
                    .await
                    .is_err()
                {
                    return;
                }
                if done {
                    let _ = inbox
                        .send(Inbound::StreamClosed {
                            turn_gen,
                            error: None,
                        })
                        .await;
                    return;
                }
            }
            Ok(Some(Err(e))) => {
                let _ = inbox
                    .send(Inbound::StreamClosed {
                        turn_gen,
                        error: Some(e),
                    })
                    .await;
                return;
            }
        }
    }
}
