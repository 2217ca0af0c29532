//! Execution state machine
//!
//! One machine per session. It is the single authority on where a session is
//! in its step sequence; every other component only feeds its guards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Transitions kept per session
pub const MAX_TRANSITION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionState {
    Idle,
    ProcessingPrompt,
    StreamingResponse,
    ExecutingTool,
    ProgressCheck,
    PhaseTransition,
    ResourcePaused,
    Halted,
    Error,
}

impl ExecutionState {
    /// Halted and Error require an external reset to leave
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Halted | ExecutionState::Error)
    }

    /// Ordinary guarded edges; pause, abort, failure and reset have dedicated entry points
    pub fn can_transition_to(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Idle, ProcessingPrompt)
                | (ProcessingPrompt, StreamingResponse)
                | (StreamingResponse, ExecutingTool)
                | (StreamingResponse, ProgressCheck)
                | (ExecutingTool, ProgressCheck)
                | (ProgressCheck, PhaseTransition)
                | (ProgressCheck, ProcessingPrompt)
                | (ProgressCheck, Halted)
                | (ProgressCheck, Idle)
                | (PhaseTransition, ProcessingPrompt)
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Coarse task phase, advanced on semantic progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Planning,
    Implementation,
    Validation,
    Refinement,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Planning => Some(Phase::Implementation),
            Phase::Implementation => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Refinement),
            Phase::Refinement => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("◆ INVALID TRANSITION: {from} -> {to}")]
    Invalid {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("◆ PENDING TOOL RESULTS BLOCK NEW PROMPT")]
    PendingToolResults,

    #[error("◆ NOT PAUSED: {0}")]
    NotPaused(ExecutionState),

    #[error("◆ SESSION IN TERMINAL STATE: {0}")]
    Terminal(ExecutionState),
}

/// One recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub reason: String,
    pub at: DateTime<Utc>,
    /// Time spent in `from`
    pub elapsed: Duration,
}

pub struct StateMachine {
    session_id: String,
    state: ExecutionState,
    phase: Phase,
    entered_at: Instant,
    resume_to: Option<ExecutionState>,
    history: VecDeque<Transition>,
    tx: watch::Sender<ExecutionState>,
}

impl StateMachine {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(ExecutionState::Idle);
        Self {
            session_id: session_id.into(),
            state: ExecutionState::Idle,
            phase: Phase::Planning,
            entered_at: Instant::now(),
            resume_to: None,
            history: VecDeque::with_capacity(MAX_TRANSITION_HISTORY),
            tx,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// State the machine will return to once resources recover
    pub fn resume_target(&self) -> Option<ExecutionState> {
        self.resume_to
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history.iter().cloned().collect()
    }

    /// Take a guarded edge of the transition table
    pub fn transition(
        &mut self,
        to: ExecutionState,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            warn!(
                session_id = %self.session_id,
                from = %self.state,
                to = %to,
                "◆ REJECTED TRANSITION"
            );
            return Err(TransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        self.apply(to, reason);
        Ok(())
    }

    /// `Idle -> ProcessingPrompt`, refused while tool results are outstanding
    pub fn begin_prompt(&mut self, has_pending_tool_results: bool) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        if has_pending_tool_results {
            return Err(TransitionError::PendingToolResults);
        }
        self.transition(ExecutionState::ProcessingPrompt, "new prompt")
    }

    /// Pause, resuming later to the current state
    pub fn pause(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.pause_before(self.state, reason)
    }

    /// Pause at a checkpoint, resuming later to `resume_to`
    pub fn pause_before(
        &mut self,
        resume_to: ExecutionState,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if self.state == ExecutionState::ResourcePaused {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        if resume_to != self.state && !self.state.can_transition_to(resume_to) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: resume_to,
            });
        }
        self.resume_to = Some(resume_to);
        self.apply(ExecutionState::ResourcePaused, reason);
        Ok(())
    }

    /// Leave `ResourcePaused` for the recorded target
    pub fn resume(&mut self) -> Result<ExecutionState, TransitionError> {
        if self.state != ExecutionState::ResourcePaused {
            return Err(TransitionError::NotPaused(self.state));
        }
        let target = self.resume_to.take().unwrap_or(ExecutionState::Idle);
        self.apply(target, "resources recovered");
        Ok(target)
    }

    /// Cancellation: any non-terminal state back to `Idle`
    pub fn abort(&mut self, reason: &str) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        self.resume_to = None;
        if self.state != ExecutionState::Idle {
            self.apply(ExecutionState::Idle, reason);
        }
        Ok(())
    }

    /// Unrecoverable fault
    pub fn fail(&mut self, reason: &str) {
        self.resume_to = None;
        if self.state != ExecutionState::Error {
            self.apply(ExecutionState::Error, reason);
        }
    }

    /// External re-initiation of a terminal session
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if !self.state.is_terminal() {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: ExecutionState::Idle,
            });
        }
        self.phase = Phase::Planning;
        self.apply(ExecutionState::Idle, "reset");
        Ok(())
    }

    /// Move to the next phase; only legal while in `PhaseTransition`
    pub fn advance_phase(&mut self, next: Phase) -> Result<(), TransitionError> {
        if self.state != ExecutionState::PhaseTransition {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: ExecutionState::PhaseTransition,
            });
        }
        info!(
            session_id = %self.session_id,
            from = %self.phase,
            to = %next,
            "◆ PHASE ADVANCED"
        );
        self.phase = next;
        Ok(())
    }

    fn apply(&mut self, to: ExecutionState, reason: &str) {
        let from = self.state;
        let elapsed = self.entered_at.elapsed();
        self.state = to;
        self.entered_at = Instant::now();

        if self.history.len() >= MAX_TRANSITION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
            elapsed,
        });

        debug!(
            session_id = %self.session_id,
            from = %from,
            to = %to,
            reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "◆ STATE TRANSITION"
        );
        self.tx.send_replace(to);
    }
}
