//! Coordinator facade
//!
//! [`Coordinator`] is a cheap, cloneable handle. Every call becomes a
//! [`Command`] for the control loop task, which is the only place session
//! state is mutated, and waits for the loop's reply.
//!
//! ```ignore
//! let (coordinator, mut events) = Coordinator::new(factory, prompt, CoordinatorSettings::default());
//! coordinator.submit_message("session-1", "tidy the build directory").await?;
//! while let Some((session_id, event)) = events.recv().await {
//!     println!("{}: {:?}", session_id, event);
//! }
//! ```

mod control_loop;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::approval::ConfirmationPrompt;
use crate::config::CoordinatorSettings;
use crate::engine::{ConversationFactory, ConversationSummary};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;
use crate::session::{EventReceiver, SessionExecutionState, SessionId};
use control_loop::ControlLoop;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Result of submitting a user message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// A new turn was started with the message
    Started,
    /// A turn was already running; the message went to the engine's queue
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOutcome {
    Requested,
    NothingToPause,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwitchOutcome {
    AlreadyActive,
    /// The current session is running; answer with [`Coordinator::confirm_switch`]
    AwaitingConfirmation,
    Switched { previous: Option<SessionId> },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    NotRunning,
    /// The worker stopped on its own after the pause request
    Cooperative,
    /// The worker was aborted after the timeout
    Forced,
}

pub(crate) enum Command {
    Submit {
        session_id: SessionId,
        text: String,
        reply: Reply<Result<SubmitOutcome>>,
    },
    SubmitToCurrent {
        text: String,
        reply: Reply<Result<SubmitOutcome>>,
    },
    Pause {
        session_id: SessionId,
        reply: Reply<Result<PauseOutcome>>,
    },
    Switch {
        target: SessionId,
        reply: Reply<Result<SwitchOutcome>>,
    },
    ConfirmSwitch {
        confirmed: bool,
        reply: Reply<Result<SwitchOutcome>>,
    },
    SetPolicy {
        policy: ConfirmationPolicy,
        reply: Reply<Result<()>>,
    },
    Policy {
        reply: Reply<ConfirmationPolicy>,
    },
    Cancel {
        session_id: SessionId,
        timeout: Duration,
        reply: Reply<Result<CancelOutcome>>,
    },
    Resume {
        session_id: SessionId,
        reply: Reply<Result<()>>,
    },
    CreateSession {
        reply: Reply<Result<SessionId>>,
    },
    Condense {
        session_id: SessionId,
        reply: Reply<Result<()>>,
    },
    State {
        session_id: SessionId,
        reply: Reply<Result<SessionExecutionState>>,
    },
    Watch {
        session_id: SessionId,
        reply: Reply<Result<watch::Receiver<SessionExecutionState>>>,
    },
    Summary {
        session_id: SessionId,
        reply: Reply<Result<ConversationSummary>>,
    },
    CurrentSession {
        reply: Reply<Option<SessionId>>,
    },
    Sessions {
        reply: Reply<Vec<SessionId>>,
    },
    LiveSessions {
        reply: Reply<Vec<SessionId>>,
    },
    Stop {
        reply: Reply<()>,
    },
}

/// Handle to a running coordinator
#[derive(Clone)]
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
    cancel_timeout: Duration,
}

impl Coordinator {
    /// Start the control loop
    ///
    /// Returns the handle and the receiver every session event is published
    /// on. Must be called from within a tokio runtime.
    pub fn new(
        factory: Arc<dyn ConversationFactory>,
        prompt: Arc<dyn ConfirmationPrompt>,
        settings: CoordinatorSettings,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let cancel_timeout = settings.cancel_timeout;

        let control = ControlLoop::new(factory, prompt, settings, events_tx, commands_rx);
        tokio::spawn(control.run());

        let coordinator = Self {
            commands: commands_tx,
            cancel_timeout,
        };
        (coordinator, events_rx)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ControlLoopClosed)?;
        response.await.map_err(|_| Error::ControlLoopClosed)
    }

    /// Send a user message, starting a turn unless one is already running
    pub async fn submit_message(&self, session_id: &str, text: &str) -> Result<SubmitOutcome> {
        self.request(|reply| Command::Submit {
            session_id: session_id.to_string(),
            text: text.to_string(),
            reply,
        })
        .await?
    }

    /// Send a user message to the active session
    pub async fn submit_to_current(&self, text: &str) -> Result<SubmitOutcome> {
        self.request(|reply| Command::SubmitToCurrent {
            text: text.to_string(),
            reply,
        })
        .await?
    }

    pub async fn request_pause(&self, session_id: &str) -> Result<PauseOutcome> {
        self.request(|reply| Command::Pause {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// Move control focus to `target`
    pub async fn request_switch(&self, target: &str) -> Result<SwitchOutcome> {
        self.request(|reply| Command::Switch {
            target: target.to_string(),
            reply,
        })
        .await?
    }

    /// Answer a switch that is awaiting confirmation
    pub async fn confirm_switch(&self, confirmed: bool) -> Result<SwitchOutcome> {
        self.request(|reply| Command::ConfirmSwitch { confirmed, reply })
            .await?
    }

    /// Replace the confirmation policy for the active session and new sessions
    pub async fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> Result<()> {
        self.request(|reply| Command::SetPolicy { policy, reply })
            .await?
    }

    /// Policy the coordinator currently applies
    pub async fn confirmation_policy(&self) -> Result<ConfirmationPolicy> {
        self.request(|reply| Command::Policy { reply }).await
    }

    /// Stop a session's worker, aborting it if it has not stopped within `timeout`
    pub async fn request_cancel(&self, session_id: &str, timeout: Duration) -> Result<CancelOutcome> {
        self.request(|reply| Command::Cancel {
            session_id: session_id.to_string(),
            timeout,
            reply,
        })
        .await?
    }

    /// [`Coordinator::request_cancel`] with the configured timeout
    pub async fn cancel(&self, session_id: &str) -> Result<CancelOutcome> {
        self.request_cancel(session_id, self.cancel_timeout).await
    }

    /// Run a turn without a new message, e.g. after a deferred confirmation
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        self.request(|reply| Command::Resume {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// Start a fresh session and focus it
    pub async fn create_session(&self) -> Result<SessionId> {
        self.request(|reply| Command::CreateSession { reply }).await?
    }

    /// Condense a session's history; refused while it runs
    pub async fn condense(&self, session_id: &str) -> Result<()> {
        self.request(|reply| Command::Condense {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// Snapshot of a session's execution state
    pub async fn state(&self, session_id: &str) -> Result<SessionExecutionState> {
        self.request(|reply| Command::State {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn watch_state(&self, session_id: &str) -> Result<watch::Receiver<SessionExecutionState>> {
        self.request(|reply| Command::Watch {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// Agent output of a session so far, read from the engine's event log
    pub async fn summary(&self, session_id: &str) -> Result<ConversationSummary> {
        self.request(|reply| Command::Summary {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn current_session(&self) -> Result<Option<SessionId>> {
        self.request(|reply| Command::CurrentSession { reply }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionId>> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    /// Cancel every running worker, then stop the control loop
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let live = self.request(|reply| Command::LiveSessions { reply }).await?;
        info!("Shutting down coordinator ({} running sessions)", live.len());

        let results = join_all(live.iter().map(|id| self.request_cancel(id, timeout))).await;
        for (id, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!(session_id = %id, "Cancel during shutdown failed: {}", e);
            }
        }

        self.request(|reply| Command::Stop { reply }).await
    }
}
