//! Conductor Core Library
//!
//! Multi-session execution coordination for agent conversations:
//! - Confirmation policies and the confirmation controller
//! - Per-session execution state and background workers
//! - Session registry and switching
//! - The coordinator facade and its control loop
//!
//! The agent engine itself is external and reached through
//! [`engine::Conversation`].

pub mod approval;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod policy;
pub mod session;

pub use approval::{
    ChannelPrompt, ConfirmationController, ConfirmationPrompt, Decision, DecisionKind, DecisionRequest, Evaluation,
    Resolution, decision_channel,
};
pub use config::{Config, ConfigManager, CoordinatorSettings};
pub use coordinator::{CancelOutcome, Coordinator, PauseOutcome, SubmitOutcome, SwitchOutcome};
pub use engine::{
    Conversation, ConversationFactory, ConversationSummary, EngineEvent, PendingAction, Script, ScriptStep, ScriptedConversation,
    ScriptedFactory, StepUsage,
};
pub use error::{Error, Result};
pub use policy::{ConfirmationPolicy, RiskLevel};
pub use session::{
    EventReceiver, ExecutionStatus, MetricsSnapshot, SessionEvent, SessionExecutionState, SessionId, Severity,
};
