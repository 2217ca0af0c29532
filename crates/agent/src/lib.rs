//! OPERATIVE: Execution Engine Core
//!
//! Per-session coordinator, its state machine and the guards that feed it:
//! progress tracking, loop and drift detection, edit resolution and the
//! tool registry.

use thiserror::Error;

pub mod anomaly;
pub mod context;
pub mod coordinator;
pub mod edit;
pub mod progress;
pub mod state;
pub mod tools;
pub mod validator;

pub use anomaly::{Anomaly, AnomalyDetector};
pub use context::ContextBuilder;
pub use coordinator::{Attachment, Coordinator, RunOutcome, SessionAgentCall, StopReason};
pub use edit::{EditResolver, Resolution};
pub use progress::{ProgressTracker, ToolEffects};
pub use state::{ExecutionState, Phase, StateMachine, Transition, TransitionError};
pub use tools::{register_default_tools, ToolOutput, ToolRegistry, ToolTrait};
pub use validator::ValidationError;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("◆ SESSION BUSY: {0}")]
    SessionBusy(String),

    #[error("◆ SESSION {session_id} IS {state}; RESET REQUIRED")]
    SessionHalted {
        session_id: String,
        state: ExecutionState,
    },

    #[error("◆ HISTORY REJECTED: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    #[error("◆ SOLITON ERROR: {0}")]
    Provider(#[from] warden_provider::ProviderError),

    #[error("◆ DATA LINK ERROR: {0}")]
    Store(#[from] warden_session::StoreError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
