//! Execution worker: runs one agent turn in the background
//!
//! Engine calls block, so each one goes to the blocking pool while holding the
//! session's step gate. Everything the worker learns (status, metrics,
//! policy changes, notices) is reported as a [`WorkerMessage`]; the worker
//! never touches session state itself.

use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info};

use super::state::{ExecutionStatus, MetricsSnapshot};
use super::types::{SessionId, Severity};
use crate::approval::{ConfirmationController, Evaluation, Resolution};
use crate::engine::{Conversation, PendingAction};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;

/// Something a worker reports to the control loop
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerUpdate {
    Status {
        status: ExecutionStatus,
        pending_action_count: usize,
    },
    /// Actions were escalated; the session now waits for the user
    AwaitingDecision { actions: Vec<PendingAction> },
    Metrics(MetricsSnapshot),
    /// A decision installed a new policy
    PolicyChanged(ConfirmationPolicy),
    Notice {
        title: String,
        message: String,
        severity: Severity,
    },
    /// The worker task is gone
    Exited,
}

/// A [`WorkerUpdate`] tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMessage {
    pub session_id: SessionId,
    pub epoch: u64,
    pub update: WorkerUpdate,
}

pub type WorkerSender = mpsc::UnboundedSender<WorkerMessage>;

/// Run one engine call on the blocking pool
///
/// With a gate, the owned permit travels into the blocking closure, so a call
/// left running after its task was aborted still holds the gate until it
/// returns. A panic inside the call becomes [`Error::Unexpected`].
pub async fn engine_call<T, F>(
    conversation: Arc<dyn Conversation>,
    step_gate: Option<Arc<Semaphore>>,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Conversation) -> Result<T> + Send + 'static,
{
    let permit = match step_gate {
        Some(gate) => Some(
            gate.acquire_owned()
                .await
                .map_err(|_| Error::Unexpected("step gate closed".to_string()))?,
        ),
        None => None,
    };

    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        call(conversation.as_ref())
    })
    .await
    .map_err(|e| Error::Unexpected(format!("engine call did not complete: {}", e)))?
}

/// Reports [`WorkerUpdate::Exited`] however the worker task ends
struct ExitGuard {
    session_id: SessionId,
    epoch: u64,
    updates: WorkerSender,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.updates.send(WorkerMessage {
            session_id: self.session_id.clone(),
            epoch: self.epoch,
            update: WorkerUpdate::Exited,
        });
    }
}

/// One background turn for one session
pub struct ExecutionWorker {
    session_id: SessionId,
    epoch: u64,
    conversation: Arc<dyn Conversation>,
    controller: Arc<ConfirmationController>,
    policy_rx: watch::Receiver<ConfirmationPolicy>,
    policy: ConfirmationPolicy,
    step_gate: Arc<Semaphore>,
    updates: WorkerSender,
    /// User messages handed to the engine before the first step
    messages: Vec<String>,
}

impl ExecutionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        epoch: u64,
        conversation: Arc<dyn Conversation>,
        controller: Arc<ConfirmationController>,
        mut policy_rx: watch::Receiver<ConfirmationPolicy>,
        step_gate: Arc<Semaphore>,
        updates: WorkerSender,
        messages: Vec<String>,
    ) -> Self {
        let policy = *policy_rx.borrow_and_update();
        Self {
            session_id,
            epoch,
            conversation,
            controller,
            policy_rx,
            policy,
            step_gate,
            updates,
            messages,
        }
    }

    /// Run the turn to completion, reporting as it goes
    pub async fn run(mut self) {
        let _exit = ExitGuard {
            session_id: self.session_id.clone(),
            epoch: self.epoch,
            updates: self.updates.clone(),
        };
        debug!(session_id = %self.session_id, epoch = self.epoch, "Worker starting");

        self.report_status(ExecutionStatus::Running, 0);
        match self.turn().await {
            Ok(status) => {
                info!(session_id = %self.session_id, %status, "Turn settled");
            }
            Err(e) => {
                let title = match &e {
                    Error::Unexpected(_) => "Unexpected Error",
                    _ => "Conversation Error",
                };
                error!(session_id = %self.session_id, "{}: {}", title, e);
                self.report(WorkerUpdate::Notice {
                    title: title.to_string(),
                    message: e.to_string(),
                    severity: Severity::Error,
                });
                if let Ok(metrics) = self.call(|c| Ok(c.metrics())).await {
                    self.report(WorkerUpdate::Metrics(metrics));
                }
                self.report_status(ExecutionStatus::Paused, 0);
            }
        }
    }

    async fn turn(&mut self) -> Result<ExecutionStatus> {
        for text in std::mem::take(&mut self.messages) {
            self.call(move |c| c.send_message(&text)).await?;
        }

        // A reloaded conversation may already be waiting on a decision
        let mut status = self.call(|c| Ok(c.execution_status())).await?;
        if status != ExecutionStatus::WaitingForConfirmation {
            status = self.step().await?;
        }

        loop {
            match status {
                ExecutionStatus::Finished | ExecutionStatus::Paused => {
                    self.report_status(status, 0);
                    return Ok(status);
                }
                ExecutionStatus::WaitingForConfirmation => match self.confirm().await? {
                    Resolution::Proceed { .. } => status = self.step().await?,
                    Resolution::EndTurn => {
                        self.report_status(ExecutionStatus::Running, 0);
                        self.report_status(ExecutionStatus::Finished, 0);
                        return Ok(ExecutionStatus::Finished);
                    }
                    Resolution::Pause => {
                        self.report_status(ExecutionStatus::Paused, 0);
                        return Ok(ExecutionStatus::Paused);
                    }
                },
                other => {
                    return Err(Error::Engine(format!(
                        "engine settled in unexpected status: {}",
                        other
                    )));
                }
            }
        }
    }

    /// One blocking `run()`, then status and metrics
    async fn step(&mut self) -> Result<ExecutionStatus> {
        let (status, metrics) = self
            .call(|c| {
                c.run()?;
                Ok((c.execution_status(), c.metrics()))
            })
            .await?;
        debug!(session_id = %self.session_id, %status, steps = metrics.steps, "Engine step done");
        self.report(WorkerUpdate::Metrics(metrics));
        Ok(status)
    }

    async fn confirm(&mut self) -> Result<Resolution> {
        let pending = self
            .call(|c| {
                let events = c.events();
                Ok(c.unmatched_actions(&events))
            })
            .await?;

        self.refresh_policy();
        let actions = match ConfirmationController::evaluate(&pending, &self.policy) {
            Evaluation::AutoApprove => {
                debug!(
                    session_id = %self.session_id,
                    count = pending.len(),
                    policy = %self.policy,
                    "Auto-approving pending actions"
                );
                return Ok(Resolution::Proceed { policy_change: None });
            }
            Evaluation::Escalate(actions) => actions,
        };

        self.report(WorkerUpdate::AwaitingDecision {
            actions: actions.clone(),
        });
        let decision = self.controller.escalate(&self.session_id, actions).await;
        info!(session_id = %self.session_id, decision = %decision.kind, "Applying decision");

        let resolution = self
            .call(move |c| ConfirmationController::apply(c, &decision))
            .await?;

        if let Resolution::Proceed { policy_change } = resolution {
            if let Some(policy) = policy_change {
                // Anything published before the decision is superseded by it
                let _ = self.policy_rx.borrow_and_update();
                self.policy = policy;
                self.report(WorkerUpdate::PolicyChanged(policy));
            }
            self.report_status(ExecutionStatus::Running, 0);
        }
        Ok(resolution)
    }

    fn refresh_policy(&mut self) {
        if self.policy_rx.has_changed().unwrap_or(false) {
            self.policy = *self.policy_rx.borrow_and_update();
            debug!(session_id = %self.session_id, policy = %self.policy, "Picked up policy change");
        }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Conversation) -> Result<T> + Send + 'static,
    {
        engine_call(self.conversation.clone(), Some(self.step_gate.clone()), f).await
    }

    fn report_status(&self, status: ExecutionStatus, pending_action_count: usize) {
        self.report(WorkerUpdate::Status {
            status,
            pending_action_count,
        });
    }

    fn report(&self, update: WorkerUpdate) {
        let message = WorkerMessage {
            session_id: self.session_id.clone(),
            epoch: self.epoch,
            update,
        };
        if self.updates.send(message).is_err() {
            debug!(session_id = %self.session_id, "Control loop gone, dropping worker update");
        }
    }
}
