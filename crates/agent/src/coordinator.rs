//! Coordinator: the per-session run loop
//!
//! One `run` drives a session from a new prompt back to `Idle` (or to
//! `Halted`/`Error`). Each step checks resource admission, injects queued
//! anomaly warnings, validates the outgoing history, streams one assistant
//! turn, dispatches its tool calls and decides on continuation from the
//! state machine, never from the assistant's wording.

use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_config::{AnomalyConfig, Config, RuntimeConfig};
use warden_monitor::ResourceMonitor;
use warden_provider::{
    ChatRequest, ContentPart, FinishReason, Message, Provider, ProviderError, Role, StreamEvent,
    ToolCall, ToolResult,
};
use warden_session::MessageStore;

use crate::anomaly::AnomalyDetector;
use crate::context::ContextBuilder;
use crate::progress::ProgressTracker;
use crate::state::{ExecutionState, StateMachine, Transition, TransitionError};
use crate::tools::{ToolError, ToolRegistry};
use crate::validator;
use crate::{AgentError, Result};

/// Named text attached to a prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

/// Boundary input for one run
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAgentCall {
    pub session_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
}

impl SessionAgentCall {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    fn to_message(&self) -> Message {
        let mut parts = vec![ContentPart::Text {
            text: self.prompt.clone(),
        }];
        for attachment in &self.attachments {
            parts.push(ContentPart::Text {
                text: format!(
                    "<attachment name=\"{}\">\n{}\n</attachment>",
                    attachment.name, attachment.content
                ),
            });
        }
        Message::new(Role::User, parts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Halted(String),
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub final_text: Option<String>,
    pub state: ExecutionState,
    pub steps: u32,
    pub tool_calls: usize,
    pub stop_reason: StopReason,
}

/// Mutable per-session data, held for the whole of a run
struct SessionRuntime {
    progress: ProgressTracker,
    anomalies: AnomalyDetector,
    last_continuation: Option<Instant>,
}

/// Shared handle; the machine and cancel token are reachable while a run is in flight
#[derive(Clone)]
struct SessionHandle {
    runtime: Arc<tokio::sync::Mutex<SessionRuntime>>,
    machine: Arc<Mutex<StateMachine>>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl SessionHandle {
    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        match self.machine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fresh_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut guard) => *guard = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    fn cancel(&self) {
        match self.cancel.lock() {
            Ok(guard) => guard.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }
}

/// One streamed assistant turn
#[derive(Debug, Default)]
struct Turn {
    text: String,
    reasoning: String,
    calls: Vec<ToolCall>,
}

enum StepError {
    Canceled,
    Provider(ProviderError),
    Transition(TransitionError),
}

/// Whether a checkpoint let the run through
enum Checkpoint {
    Proceed,
    Canceled,
}

pub struct Coordinator {
    provider: Arc<dyn Provider>,
    store: Arc<dyn MessageStore>,
    tools: Arc<ToolRegistry>,
    monitor: Option<Arc<ResourceMonitor>>,
    context: ContextBuilder,
    runtime: RuntimeConfig,
    anomaly: AnomalyConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl Coordinator {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn MessageStore>,
        tools: Arc<ToolRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            store,
            tools,
            monitor: None,
            context: ContextBuilder::new(config.workspace_path()),
            runtime: config.runtime.clone(),
            anomaly: config.anomaly.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn session(&self, session_id: &str) -> SessionHandle {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHandle {
                runtime: Arc::new(tokio::sync::Mutex::new(SessionRuntime {
                    progress: ProgressTracker::new(),
                    anomalies: AnomalyDetector::new(&self.anomaly),
                    last_continuation: None,
                })),
                machine: Arc::new(Mutex::new(StateMachine::new(session_id))),
                cancel: Arc::new(Mutex::new(CancellationToken::new())),
            })
            .clone()
    }

    /// Current state; sessions never seen are `Idle`
    pub fn state(&self, session_id: &str) -> ExecutionState {
        self.session(session_id).machine().state()
    }

    pub fn subscribe_state(&self, session_id: &str) -> watch::Receiver<ExecutionState> {
        self.session(session_id).machine().subscribe()
    }

    pub fn state_history(&self, session_id: &str) -> Vec<Transition> {
        self.session(session_id).machine().history()
    }

    /// Abort the session's in-flight run at its next checkpoint
    pub fn cancel(&self, session_id: &str) {
        info!(session_id, "◆ CANCEL REQUESTED");
        self.session(session_id).cancel();
    }

    /// Bring a `Halted` or `Error` session back to `Idle`
    ///
    /// Tool calls a failed run left without results are closed as canceled
    /// first, so the next prompt is admitted.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        let handle = self.session(session_id);
        let mut runtime = handle.runtime.lock().await;
        let terminal = handle.machine().state().is_terminal();
        if terminal {
            self.close_pending_calls(session_id).await?;
        }
        handle.machine().reset()?;
        runtime.progress.reset_streaks();
        runtime.anomalies.clear();
        info!(session_id, "◆ SESSION RESET");
        Ok(())
    }

    pub async fn run(&self, call: SessionAgentCall) -> Result<RunOutcome> {
        let session_id = call.session_id.clone();
        let handle = self.session(&session_id);

        let mut runtime = handle
            .runtime
            .clone()
            .try_lock_owned()
            .map_err(|_| AgentError::SessionBusy(session_id.clone()))?;

        let history = match self.store.list_messages(&session_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "◆ HISTORY UNREADABLE");
                handle.machine().fail(&err.to_string());
                return Err(err.into());
            }
        };
        if validator::has_pending_tool_results(&history) {
            warn!(session_id = %session_id, "◆ REFUSING PROMPT: TOOL RESULTS PENDING");
            return Err(AgentError::SessionBusy(session_id));
        }
        validator::validate(&history)?;

        {
            let mut machine = handle.machine();
            let state = machine.state();
            if state.is_terminal() {
                return Err(AgentError::SessionHalted { session_id, state });
            }
            machine.begin_prompt(false)?;
        }

        let cancel = handle.fresh_cancel_token();
        info!(session_id = %session_id, "◆ RUN STARTED");

        let result = self
            .run_steps(&call, &handle, &mut runtime, history, &cancel)
            .await;

        match &result {
            Ok(outcome) => info!(
                session_id = %session_id,
                steps = outcome.steps,
                tool_calls = outcome.tool_calls,
                stop_reason = ?outcome.stop_reason,
                "◆ RUN FINISHED"
            ),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "◆ RUN FAILED");
                handle.machine().fail(&err.to_string());
                if let Err(close) = self.close_pending_calls(&session_id).await {
                    warn!(session_id = %session_id, error = %close, "◆ OPEN TOOL CALLS LEFT FOR RESET");
                }
            }
        }
        result
    }

    /// Append canceled results for calls still awaiting one; returns how many
    async fn close_pending_calls(&self, session_id: &str) -> Result<usize> {
        let history = self.store.list_messages(session_id).await?;
        let pending = validator::pending_tool_calls(&history);
        if pending.is_empty() {
            return Ok(0);
        }
        let results = pending.iter().map(ToolResult::canceled).collect();
        self.store
            .append_message(session_id, &Message::tool_results(results))
            .await?;
        warn!(session_id, count = pending.len(), "◆ OPEN TOOL CALLS CANCELED");
        Ok(pending.len())
    }

    async fn run_steps(
        &self,
        call: &SessionAgentCall,
        handle: &SessionHandle,
        runtime: &mut SessionRuntime,
        mut history: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let session_id = call.session_id.as_str();
        let mut outcome = RunOutcome {
            session_id: session_id.to_string(),
            final_text: None,
            state: ExecutionState::ProcessingPrompt,
            steps: 0,
            tool_calls: 0,
            stop_reason: StopReason::Completed,
        };

        runtime.anomalies.set_task(call.prompt.clone());
        self.append(session_id, &mut history, call.to_message()).await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_canceled(handle, outcome));
            }
            if let Checkpoint::Canceled = self.checkpoint(handle, cancel, None).await? {
                return Ok(self.finish_canceled(handle, outcome));
            }
            outcome.steps += 1;
            debug!(session_id, step = outcome.steps, "◆ STEP");

            for anomaly in runtime.anomalies.take_pending() {
                self.append(session_id, &mut history, anomaly.to_message())
                    .await?;
            }
            validator::validate_outgoing(&history)?;

            let turn = match self.stream_turn(handle, runtime, &history, cancel).await {
                Ok(turn) => turn,
                Err(StepError::Canceled) => return Ok(self.finish_canceled(handle, outcome)),
                Err(StepError::Provider(err)) => return Err(err.into()),
                Err(StepError::Transition(err)) => return Err(err.into()),
            };

            let calls = turn.calls.clone();
            self.append(
                session_id,
                &mut history,
                Message::assistant_turn(&turn.reasoning, &turn.text, turn.calls),
            )
            .await?;

            if calls.is_empty() {
                let mut machine = handle.machine();
                machine.transition(ExecutionState::ProgressCheck, "turn ended without tool calls")?;
                machine.transition(ExecutionState::Idle, "task complete")?;
                outcome.final_text = Some(turn.text);
                outcome.state = machine.state();
                return Ok(outcome);
            }

            handle
                .machine()
                .transition(ExecutionState::ExecutingTool, "tool calls emitted")?;

            let dispatch = self.dispatch(handle, runtime, &calls, cancel).await?;
            outcome.tool_calls += dispatch.executed;
            self.append(session_id, &mut history, Message::tool_results(dispatch.results))
                .await?;
            if dispatch.canceled {
                return Ok(self.finish_canceled(handle, outcome));
            }

            match self
                .checkpoint(handle, cancel, Some(ExecutionState::ProgressCheck))
                .await?
            {
                Checkpoint::Canceled => return Ok(self.finish_canceled(handle, outcome)),
                Checkpoint::Proceed => {
                    let mut machine = handle.machine();
                    if machine.state() != ExecutionState::ProgressCheck {
                        machine.transition(ExecutionState::ProgressCheck, "tool results recorded")?;
                    }
                }
            }

            runtime.progress.finish_turn(dispatch.stalled);
            if let Some(reason) = self.halt_reason(runtime, outcome.steps) {
                let mut machine = handle.machine();
                machine.transition(ExecutionState::Halted, &reason)?;
                warn!(session_id, reason = %reason, "◆ SESSION HALTED");
                outcome.state = machine.state();
                outcome.stop_reason = StopReason::Halted(reason);
                return Ok(outcome);
            }

            {
                let mut machine = handle.machine();
                match runtime.progress.next_phase(machine.phase()) {
                    Some(next) => {
                        machine.transition(ExecutionState::PhaseTransition, "semantic progress")?;
                        machine.advance_phase(next)?;
                        runtime.progress.entered_phase(next);
                        machine.transition(ExecutionState::ProcessingPrompt, "next phase")?;
                    }
                    None => {
                        machine.transition(ExecutionState::ProcessingPrompt, "continue")?;
                    }
                }
            }

            if let Checkpoint::Canceled = self.cooldown(runtime, cancel).await {
                return Ok(self.finish_canceled(handle, outcome));
            }
        }
    }

    fn halt_reason(&self, runtime: &SessionRuntime, steps: u32) -> Option<String> {
        let errors = runtime.progress.consecutive_errors();
        if errors >= self.runtime.consecutive_error_limit {
            return Some(format!("{} consecutive tool errors", errors));
        }
        let stalled = runtime.progress.no_progress_turns();
        if stalled >= self.runtime.max_no_progress_turns {
            return Some(format!("{} turns without progress", stalled));
        }
        if steps >= self.runtime.max_steps {
            return Some(format!("step budget of {} exhausted", self.runtime.max_steps));
        }
        None
    }

    async fn append(
        &self,
        session_id: &str,
        history: &mut Vec<Message>,
        message: Message,
    ) -> Result<()> {
        self.store.append_message(session_id, &message).await?;
        history.push(message);
        Ok(())
    }

    fn finish_canceled(&self, handle: &SessionHandle, mut outcome: RunOutcome) -> RunOutcome {
        let mut machine = handle.machine();
        if let Err(e) = machine.abort("canceled") {
            warn!("◆ ABORT FAILED: {}", e);
        }
        info!(session_id = %outcome.session_id, "◆ RUN CANCELED");
        outcome.state = machine.state();
        outcome.stop_reason = StopReason::Canceled;
        outcome
    }

    /// Suspend while the monitor reports a breach; `resume_to` names the successor state
    async fn checkpoint(
        &self,
        handle: &SessionHandle,
        cancel: &CancellationToken,
        resume_to: Option<ExecutionState>,
    ) -> Result<Checkpoint> {
        let Some(monitor) = &self.monitor else {
            return Ok(Checkpoint::Proceed);
        };
        let mut admission = monitor.subscribe();
        let reason = {
            let current = admission.borrow_and_update();
            match &*current {
                warden_monitor::Admission::Admitted => return Ok(Checkpoint::Proceed),
                warden_monitor::Admission::Paused(breaches) => breaches
                    .iter()
                    .map(|b| b.message())
                    .collect::<Vec<_>>()
                    .join("; "),
            }
        };

        {
            let mut machine = handle.machine();
            match resume_to {
                Some(next) => machine.pause_before(next, &reason)?,
                None => machine.pause(&reason)?,
            }
        }
        info!(reason = %reason, "◆ PAUSED FOR RESOURCES");

        let recovered = tokio::select! {
            recovered = async { admission.wait_for(|a| a.is_admitted()).await.is_ok() } => recovered,
            _ = cancel.cancelled() => return Ok(Checkpoint::Canceled),
        };
        if !recovered {
            warn!("◆ MONITOR GONE WHILE PAUSED; RESUMING");
        }

        handle.machine().resume()?;
        Ok(Checkpoint::Proceed)
    }

    async fn cooldown(&self, runtime: &mut SessionRuntime, cancel: &CancellationToken) -> Checkpoint {
        let cooldown = self.runtime.continuation_cooldown();
        if let Some(last) = runtime.last_continuation {
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                tokio::select! {
                    _ = tokio::time::sleep(cooldown - elapsed) => {}
                    _ = cancel.cancelled() => return Checkpoint::Canceled,
                }
            }
        }
        runtime.last_continuation = Some(Instant::now());
        Checkpoint::Proceed
    }

    async fn stream_turn(
        &self,
        handle: &SessionHandle,
        runtime: &SessionRuntime,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> std::result::Result<Turn, StepError> {
        let phase = handle.machine().phase();
        let system_prompt = self
            .context
            .build_system_prompt(phase, &runtime.progress.summary())
            .await;
        let request = ChatRequest {
            model: if self.runtime.model.is_empty() {
                self.provider.model()
            } else {
                self.runtime.model.clone()
            },
            system_prompt: Some(system_prompt),
            messages: history.to_vec(),
            tools: self.tools.definitions(),
            max_tokens: self.runtime.max_tokens,
            temperature: self.runtime.temperature,
        };

        let retries = self.runtime.provider_retries;
        let mut attempt = 0;
        loop {
            match self.stream_once(handle, request.clone(), cancel).await {
                Ok(turn) => return Ok(turn),
                Err(StepError::Provider(err)) if err.is_retryable() && attempt < retries => {
                    attempt += 1;
                    let delay = self.runtime.retry_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "◆ PROVIDER FAILED; RETRYING"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StepError::Canceled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn stream_once(
        &self,
        handle: &SessionHandle,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Turn, StepError> {
        let mut stream = tokio::select! {
            opened = self.provider.stream_chat(request) => opened.map_err(StepError::Provider)?,
            _ = cancel.cancelled() => return Err(StepError::Canceled),
        };

        {
            let mut machine = handle.machine();
            if machine.state() == ExecutionState::ProcessingPrompt {
                machine
                    .transition(ExecutionState::StreamingResponse, "provider accepted")
                    .map_err(StepError::Transition)?;
            }
        }

        let mut turn = Turn::default();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = cancel.cancelled() => return Err(StepError::Canceled),
            };
            match event {
                None => break,
                Some(Err(err)) => return Err(StepError::Provider(err)),
                Some(Ok(StreamEvent::ContentDelta(text))) => turn.text.push_str(&text),
                Some(Ok(StreamEvent::ReasoningDelta(text))) => turn.reasoning.push_str(&text),
                Some(Ok(StreamEvent::ToolCall(mut call))) => {
                    if call.id.is_empty() {
                        call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    }
                    turn.calls.push(call);
                }
                Some(Ok(StreamEvent::Finish(reason))) => {
                    match reason {
                        FinishReason::Canceled => return Err(StepError::Canceled),
                        FinishReason::Error => {
                            return Err(StepError::Provider(ProviderError::Stream(
                                "turn finished with error".to_string(),
                            )))
                        }
                        FinishReason::Length => warn!("◆ TURN TRUNCATED AT TOKEN LIMIT"),
                        FinishReason::Stop | FinishReason::ToolCalls => {}
                    }
                    break;
                }
            }
        }
        Ok(turn)
    }

    async fn dispatch(
        &self,
        handle: &SessionHandle,
        runtime: &mut SessionRuntime,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<Dispatch> {
        let mut dispatch = Dispatch::default();
        let mut all_failed = true;
        let mut all_repeated = true;
        let mut warned = false;

        for (index, call) in calls.iter().enumerate() {
            if !dispatch.canceled && index > 0 {
                if let Checkpoint::Canceled = self.checkpoint(handle, cancel, None).await? {
                    dispatch.canceled = true;
                }
            }
            if dispatch.canceled || cancel.is_cancelled() {
                dispatch.canceled = true;
                dispatch.results.push(ToolResult::canceled(call));
                continue;
            }

            let recorded = runtime.anomalies.record(call);
            all_repeated &= recorded.repeated;
            warned |= recorded.warned;

            debug!(tool = %call.name, id = %call.id, "◆ DISPATCHING TOOL");
            let result = tokio::select! {
                biased;
                result = self.tools.execute(&call.name, call.arguments.clone(), cancel.child_token()) => result,
                _ = cancel.cancelled() => Err(ToolError::Canceled),
            };
            dispatch.executed += 1;

            let tool_result = match result {
                Ok(output) if !output.is_error => {
                    runtime.progress.record_success(&output.effects);
                    runtime.anomalies.record_success(call);
                    all_failed = false;
                    ToolResult::success(call, output.content)
                }
                Ok(output) => {
                    runtime.progress.record_error();
                    warned |= runtime.anomalies.record_failure(call, &output.content);
                    ToolResult::error(call, output.content)
                }
                Err(ToolError::Canceled) => {
                    dispatch.canceled = true;
                    ToolResult::canceled(call)
                }
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "◆ TOOL FAILED");
                    runtime.progress.record_error();
                    let content = err.to_string();
                    warned |= runtime.anomalies.record_failure(call, &content);
                    ToolResult::error(call, content)
                }
            };
            dispatch.results.push(tool_result);
        }

        dispatch.stalled = all_failed || all_repeated || warned;
        Ok(dispatch)
    }
}

#[derive(Default)]
struct Dispatch {
    results: Vec<ToolResult>,
    executed: usize,
    canceled: bool,
    stalled: bool,
}
