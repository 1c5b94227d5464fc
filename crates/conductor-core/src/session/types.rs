//! Session event types
//!
//! These are the notifications the coordinator publishes to control surfaces
//! (console, UI) as `(SessionId, SessionEvent)` pairs.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::state::{ExecutionStatus, MetricsSnapshot};
use crate::engine::PendingAction;
use crate::policy::ConfirmationPolicy;

/// Unique identifier for a session
pub type SessionId = String;

/// Receiver for everything the coordinator publishes
pub type EventReceiver = mpsc::UnboundedReceiver<(SessionId, SessionEvent)>;

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Information,
    Warning,
    Error,
}

/// Event published FROM the coordinator about a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new session was created
    Created,
    /// The session became the active one
    Switched { previous: Option<SessionId> },
    StatusChanged {
        status: ExecutionStatus,
        pending_action_count: usize,
    },
    /// Pending actions were escalated to the user
    ConfirmationRequired { actions: Vec<PendingAction> },
    MetricsUpdated { metrics: MetricsSnapshot },
    PolicyChanged { policy: ConfirmationPolicy },
    /// Switching away from the running session needs the user's consent
    SwitchConfirmationRequired { target: SessionId },
    /// A worker finished its turn and let go of the session
    TurnFinished { status: ExecutionStatus },
    Notification {
        title: String,
        message: String,
        severity: Severity,
    },
}

impl SessionEvent {
    pub fn status_changed(status: ExecutionStatus, pending_action_count: usize) -> Self {
        Self::StatusChanged {
            status,
            pending_action_count,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::notification(title, message, Severity::Information)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::notification(title, message, Severity::Warning)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::notification(title, message, Severity::Error)
    }

    pub fn notification(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self::Notification {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }

    /// Title of a notification, if this is one
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Notification { title, .. } => Some(title),
            _ => None,
        }
    }
}
