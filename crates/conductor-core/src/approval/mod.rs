//! Confirmation handling for pending actions
//!
//! The [`ConfirmationController`] decides, per [`ConfirmationPolicy`], whether
//! pending actions proceed on their own or go to the user, and turns the
//! user's [`Decision`] into engine calls.

pub mod channel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use channel::{ChannelPrompt, DecisionRequest, DecisionRequestReceiver, decision_channel};

use crate::engine::{Conversation, PendingAction};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;
use crate::session::SessionId;

/// Reason recorded on the engine when the user rejects without giving one
pub const DEFAULT_REJECT_REASON: &str = "User rejected the actions";

/// Default bound on how long the user may take to decide
pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(300);

/// What the user chose for a batch of pending actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Accept,
    Reject,
    /// Leave the actions unresolved and pause
    Defer,
    /// Accept and stop asking
    AlwaysProceed,
    /// Accept and only ask for high-risk actions from now on
    ConfirmRisky,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::Accept => write!(f, "accept"),
            DecisionKind::Reject => write!(f, "reject"),
            DecisionKind::Defer => write!(f, "defer"),
            DecisionKind::AlwaysProceed => write!(f, "always_proceed"),
            DecisionKind::ConfirmRisky => write!(f, "confirm_risky"),
        }
    }
}

/// A user decision, consumed once by the worker that asked for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: Option<String>,
    pub policy_change: Option<ConfirmationPolicy>,
}

impl Decision {
    fn of(kind: DecisionKind) -> Self {
        Self {
            kind,
            reason: None,
            policy_change: None,
        }
    }

    pub fn accept() -> Self {
        Self::of(DecisionKind::Accept)
    }

    pub fn reject() -> Self {
        Self::of(DecisionKind::Reject)
    }

    pub fn reject_with(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::of(DecisionKind::Reject)
        }
    }

    pub fn defer() -> Self {
        Self::of(DecisionKind::Defer)
    }

    pub fn always_proceed() -> Self {
        Self::of(DecisionKind::AlwaysProceed)
    }

    pub fn confirm_risky() -> Self {
        Self::of(DecisionKind::ConfirmRisky)
    }

    /// Attach an explicit policy change (honoured on accept)
    pub fn with_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.policy_change = Some(policy);
        self
    }

    /// Policy this decision installs, if any
    pub fn effective_policy_change(&self) -> Option<ConfirmationPolicy> {
        match self.kind {
            DecisionKind::AlwaysProceed => Some(ConfirmationPolicy::AutoApproveAll),
            DecisionKind::ConfirmRisky => Some(ConfirmationPolicy::risky()),
            DecisionKind::Accept => self.policy_change,
            DecisionKind::Reject | DecisionKind::Defer => None,
        }
    }
}

/// Outcome of evaluating pending actions against a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    AutoApprove,
    Escalate(Vec<PendingAction>),
}

/// How the turn continues after a decision was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Run the next engine step
    Proceed { policy_change: Option<ConfirmationPolicy> },
    /// Actions were rejected; the turn is over
    EndTurn,
    /// Actions stay unresolved; the conversation is paused
    Pause,
}

/// Source of user decisions
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    /// Ask the user what to do with `actions`
    async fn request_decision(&self, session_id: &SessionId, actions: Vec<PendingAction>) -> Result<Decision>;
}

/// Confirmation policy state machine shared by all workers
pub struct ConfirmationController {
    prompt: Arc<dyn ConfirmationPrompt>,
    timeout: Duration,
}

impl ConfirmationController {
    pub fn new(prompt: Arc<dyn ConfirmationPrompt>, timeout: Duration) -> Self {
        Self { prompt, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decide whether `pending` may proceed under `policy`
    ///
    /// An empty batch always auto-approves. Under a threshold policy every
    /// action has to be strictly below the threshold.
    pub fn evaluate(pending: &[PendingAction], policy: &ConfirmationPolicy) -> Evaluation {
        if pending
            .iter()
            .any(|action| policy.requires_confirmation(action.risk))
        {
            Evaluation::Escalate(pending.to_vec())
        } else {
            Evaluation::AutoApprove
        }
    }

    /// Ask the user, falling back to [`Decision::defer`] on error or timeout
    pub async fn escalate(&self, session_id: &SessionId, actions: Vec<PendingAction>) -> Decision {
        debug!(session_id = %session_id, count = actions.len(), "Escalating pending actions");
        match tokio::time::timeout(self.timeout, self.prompt.request_decision(session_id, actions)).await {
            Ok(Ok(decision)) => {
                debug!(session_id = %session_id, decision = %decision.kind, "Decision received");
                decision
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, "Confirmation failed, deferring: {}", e);
                Decision::defer()
            }
            Err(_) => {
                let err = Error::Timeout(self.timeout.as_secs());
                warn!(session_id = %session_id, "Confirmation not answered, deferring: {}", err);
                Decision::defer()
            }
        }
    }

    /// Carry out `decision` on the engine conversation
    ///
    /// Blocking: call from the blocking pool.
    pub fn apply(conversation: &dyn Conversation, decision: &Decision) -> Result<Resolution> {
        match decision.kind {
            DecisionKind::Reject => {
                let reason = decision.reason.as_deref().unwrap_or(DEFAULT_REJECT_REASON);
                conversation.reject_pending_actions(reason)?;
                Ok(Resolution::EndTurn)
            }
            DecisionKind::Defer => {
                conversation.pause()?;
                Ok(Resolution::Pause)
            }
            DecisionKind::Accept | DecisionKind::AlwaysProceed | DecisionKind::ConfirmRisky => {
                let policy_change = decision.effective_policy_change();
                if let Some(policy) = policy_change {
                    conversation.set_confirmation_policy(policy)?;
                }
                Ok(Resolution::Proceed { policy_change })
            }
        }
    }
}
