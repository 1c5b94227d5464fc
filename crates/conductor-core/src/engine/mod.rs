//! Agent execution engine boundary
//!
//! The coordinator never reasons or executes tools itself. It drives an
//! engine conversation through the [`Conversation`] trait, whose methods are
//! blocking and are always called from the blocking thread pool.

pub mod events;
pub mod scripted;

use async_trait::async_trait;
use std::sync::Arc;

pub use events::{ConversationSummary, EngineEvent, PendingAction, unmatched_actions};
pub use scripted::{Script, ScriptStep, ScriptedConversation, ScriptedFactory, StepUsage};

use crate::error::Result;
use crate::policy::ConfirmationPolicy;
use crate::session::{ExecutionStatus, MetricsSnapshot, SessionId};

/// One engine-side conversation
///
/// Implementations must tolerate `pause` (and the read-only accessors) being
/// called from another thread while `run` is executing.
pub trait Conversation: Send + Sync {
    /// Execute one blocking agent step, returning once the engine settles
    fn run(&self) -> Result<()>;

    /// Ask a running step to stop at the next opportunity
    fn pause(&self) -> Result<()>;

    /// Append a user message to the conversation
    fn send_message(&self, text: &str) -> Result<()>;

    /// Compress conversation history
    fn condense(&self) -> Result<()>;

    fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> Result<()>;

    /// Resolve every unmatched action as rejected
    fn reject_pending_actions(&self, reason: &str) -> Result<()>;

    fn execution_status(&self) -> ExecutionStatus;

    /// Snapshot of the event log
    fn events(&self) -> Vec<EngineEvent>;

    /// Actions in `events` still awaiting a decision
    fn unmatched_actions(&self, events: &[EngineEvent]) -> Vec<PendingAction> {
        events::unmatched_actions(events)
    }

    fn metrics(&self) -> MetricsSnapshot;
}

/// Opens engine conversations for session ids
#[async_trait]
pub trait ConversationFactory: Send + Sync {
    /// Open (or reload) the conversation for `session_id`
    async fn open(&self, session_id: &SessionId, policy: ConfirmationPolicy) -> Result<Arc<dyn Conversation>>;
}
