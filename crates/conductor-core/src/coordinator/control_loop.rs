//! The control loop
//!
//! A single task owns the registry, the switch state machine and every
//! session's execution record. Commands from the facade, worker updates and
//! completions of background engine calls all arrive here as messages, so no
//! lock guards session state. Anything that may block (opening a
//! conversation, engine calls, cancel waits) runs in a detached task that
//! reports back through [`ControlMsg`], so no handler here ever awaits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CancelOutcome, Command, PauseOutcome, Reply, SubmitOutcome, SwitchOutcome};
use crate::approval::{ConfirmationController, ConfirmationPrompt};
use crate::config::CoordinatorSettings;
use crate::engine::{Conversation, ConversationFactory, ConversationSummary};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;
use crate::session::{
    ConfirmStep, ExecutionStatus, Lookup, SessionEvent, SessionId, SessionRegistry, SwitchCoordinator, SwitchStep,
    WorkerMessage, WorkerSender, WorkerUpdate, engine_call,
};

type EventSender = mpsc::UnboundedSender<(SessionId, SessionEvent)>;

/// Engine call running off the loop, with the reply it owes
enum BackgroundOp {
    Enqueue(Reply<Result<SubmitOutcome>>),
    Pause(Reply<Result<PauseOutcome>>),
    Condense(Reply<Result<()>>),
    /// Pausing the session being switched away from
    SwitchPause(Reply<Result<SwitchOutcome>>),
}

/// Work waiting for a session's conversation to open
enum AfterOpen {
    Submit {
        text: String,
        reply: Reply<Result<SubmitOutcome>>,
    },
    Resume(Reply<Result<()>>),
    /// Attach the switch target
    Prepare(Reply<Result<SwitchOutcome>>),
}

/// Internal messages from detached tasks
enum ControlMsg {
    Opened {
        session_id: SessionId,
        policy: ConfirmationPolicy,
        result: Result<Arc<dyn Conversation>>,
    },
    Completed {
        session_id: SessionId,
        op: BackgroundOp,
        result: Result<()>,
    },
    CancelSettled {
        session_id: SessionId,
        epoch: u64,
        forced: bool,
    },
}

fn emit(events: &EventSender, session_id: &str, event: SessionEvent) {
    if events.send((session_id.to_string(), event)).is_err() {
        debug!(session_id = %session_id, "No event subscriber, dropping event");
    }
}

fn short_id(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

pub(super) struct ControlLoop {
    registry: SessionRegistry,
    switch: SwitchCoordinator,
    controller: Arc<ConfirmationController>,
    /// Sticky policy for the active session and every session opened later
    policy: ConfirmationPolicy,
    events: EventSender,
    commands: mpsc::Receiver<Command>,
    worker_tx: WorkerSender,
    worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    cancel_waiters: HashMap<SessionId, Vec<Reply<Result<CancelOutcome>>>>,
    open_waiters: HashMap<SessionId, Vec<AfterOpen>>,
}

impl ControlLoop {
    pub(super) fn new(
        factory: Arc<dyn ConversationFactory>,
        prompt: Arc<dyn ConfirmationPrompt>,
        settings: CoordinatorSettings,
        events: EventSender,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            registry: SessionRegistry::new(factory),
            switch: SwitchCoordinator::new(),
            controller: Arc::new(ConfirmationController::new(prompt, settings.escalation_timeout)),
            policy: settings.policy,
            events,
            commands,
            worker_tx,
            worker_rx,
            control_tx,
            control_rx,
            cancel_waiters: HashMap::new(),
            open_waiters: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self) {
        info!(policy = %self.policy, "Coordinator control loop started");
        loop {
            tokio::select! {
                biased;

                Some(message) = self.worker_rx.recv() => self.on_worker_message(message),
                Some(message) = self.control_rx.recv() => self.on_control_message(message),
                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        info!("Coordinator control loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                session_id,
                text,
                reply,
            } => self.submit(session_id, text, reply),
            Command::SubmitToCurrent { text, reply } => match self.switch.active().cloned() {
                Some(session_id) => self.submit(session_id, text, reply),
                None => {
                    let _ = reply.send(Err(Error::NoActiveSession));
                }
            },
            Command::Pause { session_id, reply } => self.pause(session_id, reply),
            Command::Switch { target, reply } => self.request_switch(target, reply),
            Command::ConfirmSwitch { confirmed, reply } => self.confirm_switch(confirmed, reply),
            Command::SetPolicy { policy, reply } => {
                self.set_policy(policy);
                let _ = reply.send(Ok(()));
            }
            Command::Policy { reply } => {
                let _ = reply.send(self.policy);
            }
            Command::Cancel {
                session_id,
                timeout,
                reply,
            } => self.cancel(session_id, timeout, reply),
            Command::Resume { session_id, reply } => self.with_session(session_id, AfterOpen::Resume(reply)),
            Command::CreateSession { reply } => {
                let _ = reply.send(self.create_session());
            }
            Command::Condense { session_id, reply } => self.condense(session_id, reply),
            Command::State { session_id, reply } => {
                let _ = reply.send(self.registry.get(&session_id).map(|h| h.state().clone()));
            }
            Command::Watch { session_id, reply } => {
                let _ = reply.send(self.registry.get(&session_id).map(|h| h.subscribe()));
            }
            Command::Summary { session_id, reply } => self.summary(session_id, reply),
            Command::CurrentSession { reply } => {
                let _ = reply.send(self.switch.active().cloned());
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.registry.ids());
            }
            Command::LiveSessions { reply } => {
                let _ = reply.send(self.registry.live_ids());
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, session_id: SessionId, text: String, reply: Reply<Result<SubmitOutcome>>) {
        if text.trim().is_empty() {
            let _ = reply.send(Err(Error::InvalidInput("message is empty".to_string())));
            return;
        }
        self.with_session(session_id, AfterOpen::Submit { text, reply });
    }

    /// Run `next` once `session_id` has a handle, opening its conversation first if needed
    fn with_session(&mut self, session_id: SessionId, next: AfterOpen) {
        match self.registry.get_or_create(&session_id, self.policy) {
            Lookup::Ready(_) => {}
            Lookup::Opening => {
                debug!(session_id = %session_id, "Conversation still opening, waiting on it");
                self.open_waiters.entry(session_id).or_default().push(next);
                return;
            }
            Lookup::Open(open) => {
                self.open_waiters.entry(session_id.clone()).or_default().push(next);
                let policy = self.policy;
                let control_tx = self.control_tx.clone();
                tokio::spawn(async move {
                    let result = open.await;
                    let _ = control_tx.send(ControlMsg::Opened {
                        session_id,
                        policy,
                        result,
                    });
                });
                return;
            }
        }
        self.after_open(session_id, next);
    }

    fn on_opened(&mut self, session_id: SessionId, policy: ConfirmationPolicy, result: Result<Arc<dyn Conversation>>) {
        let waiters = self.open_waiters.remove(&session_id).unwrap_or_default();
        let current = self.policy;

        let opened = self
            .registry
            .finish_open(&session_id, result, policy)
            .map(|handle| {
                // The sticky policy moved on while the factory was working
                if handle.state().policy != current {
                    handle.set_policy(current);
                    return Some(handle.conversation());
                }
                None
            });

        match opened {
            Ok(stale) => {
                debug!(session_id = %session_id, waiters = waiters.len(), "Conversation opened");
                if let Some(conversation) = stale {
                    self.push_policy(&session_id, conversation, current);
                }
                for next in waiters {
                    self.after_open(session_id.clone(), next);
                }
            }
            Err(e) => {
                error!(session_id = %session_id, "Failed to open conversation: {}", e);
                // Later waiters see the failure as text
                let reason = e.to_string();
                let mut first = Some(e);
                for next in waiters {
                    let e = first.take().unwrap_or_else(|| Error::Engine(reason.clone()));
                    self.open_failed(session_id.clone(), next, e);
                }
            }
        }
    }

    fn after_open(&mut self, session_id: SessionId, next: AfterOpen) {
        match next {
            AfterOpen::Submit { text, reply } => self.submit_ready(session_id, text, reply),
            AfterOpen::Resume(reply) => {
                let _ = reply.send(self.resume_ready(&session_id));
            }
            AfterOpen::Prepare(reply) => {
                let _ = reply.send(self.attach_target(session_id));
            }
        }
    }

    fn open_failed(&mut self, session_id: SessionId, next: AfterOpen, e: Error) {
        match next {
            AfterOpen::Submit { reply, .. } => {
                emit(&self.events, &session_id, SessionEvent::error("Conversation Error", e.to_string()));
                let _ = reply.send(Err(e));
            }
            AfterOpen::Resume(reply) => {
                let _ = reply.send(Err(e));
            }
            AfterOpen::Prepare(reply) => {
                let _ = reply.send(Err(self.switch_failed(session_id, e)));
            }
        }
    }

    fn submit_ready(&mut self, session_id: SessionId, text: String, reply: Reply<Result<SubmitOutcome>>) {
        let handle = match self.registry.get_mut(&session_id) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if handle.is_winding_down() {
            debug!(session_id = %session_id, "Turn is ending, holding message for the next one");
            handle.park_message(text);
            let _ = reply.send(Ok(SubmitOutcome::Queued));
            return;
        }

        if handle.has_live_worker() {
            debug!(session_id = %session_id, "Turn running, queueing message");
            let conversation = handle.conversation();
            self.spawn_engine_call(
                session_id,
                conversation,
                None,
                BackgroundOp::Enqueue(reply),
                move |c| c.send_message(&text),
            );
            return;
        }

        let result = handle
            .launch_worker(self.controller.clone(), self.worker_tx.clone(), vec![text])
            .map(|_| SubmitOutcome::Started);
        self.attach_if_focused(&session_id);
        let _ = reply.send(result);
    }

    fn resume_ready(&mut self, session_id: &str) -> Result<()> {
        let handle = self.registry.get_mut(session_id)?;
        if handle.has_live_worker() {
            return Err(Error::InvariantViolation(format!(
                "session {} already has a running turn",
                session_id
            )));
        }
        let parked = handle.take_parked();
        handle.launch_worker(self.controller.clone(), self.worker_tx.clone(), parked)?;
        self.attach_if_focused(session_id);
        Ok(())
    }

    /// Start a turn for messages parked while the last one was ending
    fn start_follow_up(&mut self, session_id: &str) {
        let Ok(handle) = self.registry.get_mut(session_id) else {
            return;
        };
        if handle.has_live_worker() {
            return;
        }
        let parked = handle.take_parked();
        if parked.is_empty() {
            return;
        }

        info!(session_id = %session_id, messages = parked.len(), "Starting follow-up turn");
        if let Err(e) = handle.launch_worker(self.controller.clone(), self.worker_tx.clone(), parked) {
            warn!(session_id = %session_id, "Failed to start follow-up turn: {}", e);
            emit(
                &self.events,
                session_id,
                SessionEvent::error("Message Error", format!("Failed to run queued message: {}", e)),
            );
            return;
        }
        self.attach_if_focused(session_id);
    }

    fn attach_if_focused(&mut self, session_id: &str) {
        if self.switch.active().map(String::as_str) == Some(session_id) && self.registry.current().is_none() {
            let _ = self.registry.attach(session_id);
        }
    }

    fn pause(&mut self, session_id: SessionId, reply: Reply<Result<PauseOutcome>>) {
        let conversation = match self.registry.get(&session_id) {
            Ok(handle) if handle.has_live_worker() => handle.conversation(),
            _ => {
                emit(
                    &self.events,
                    &session_id,
                    SessionEvent::warning("Pause", "No running conversation to pause"),
                );
                let _ = reply.send(Ok(PauseOutcome::NothingToPause));
                return;
            }
        };

        info!(session_id = %session_id, "Pausing conversation");
        emit(
            &self.events,
            &session_id,
            SessionEvent::info("Pause", "Pausing conversation, this may take a few seconds..."),
        );
        self.spawn_engine_call(session_id, conversation, None, BackgroundOp::Pause(reply), |c| c.pause());
    }

    /// Install `policy` as the sticky policy and on the sessions it governs
    ///
    /// That is the active session, or every running session while nothing is
    /// focused. A switch in flight applies it to its target on attach.
    fn set_policy(&mut self, policy: ConfirmationPolicy) {
        info!(%policy, "Confirmation policy changed");
        self.policy = policy;

        let targets = match self.switch.active() {
            Some(session_id) => vec![session_id.clone()],
            None if self.switch.is_idle() => self.registry.live_ids(),
            None => Vec::new(),
        };
        for session_id in targets {
            let Ok(handle) = self.registry.get_mut(&session_id) else {
                continue;
            };
            handle.set_policy(policy);
            let conversation = handle.conversation();
            self.push_policy(&session_id, conversation, policy);
            emit(&self.events, &session_id, SessionEvent::PolicyChanged { policy });
        }
    }

    /// Hand the policy to the engine without waiting on it
    fn push_policy(&self, session_id: &str, conversation: Arc<dyn Conversation>, policy: ConfirmationPolicy) {
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine_call(conversation, None, move |c| c.set_confirmation_policy(policy)).await {
                warn!(session_id = %session_id, "Failed to push policy to engine: {}", e);
            }
        });
    }

    fn is_running(&self, session_id: &str) -> bool {
        self.registry
            .get(session_id)
            .map(|h| h.has_live_worker() || h.state().is_active())
            .unwrap_or(false)
    }

    fn request_switch(&mut self, target: SessionId, reply: Reply<Result<SwitchOutcome>>) {
        let current_running = self
            .switch
            .active()
            .is_some_and(|current| self.is_running(current));

        match self.switch.request(&target, current_running) {
            Ok(SwitchStep::AlreadyActive) => {
                emit(
                    &self.events,
                    &target,
                    SessionEvent::info("Already Active", "This conversation is already active."),
                );
                let _ = reply.send(Ok(SwitchOutcome::AlreadyActive));
            }
            Ok(SwitchStep::Confirm { target }) => {
                let current = self.switch.active().cloned().unwrap_or_default();
                info!(from = %current, to = %target, "Switch needs confirmation");
                emit(&self.events, &current, SessionEvent::SwitchConfirmationRequired { target });
                let _ = reply.send(Ok(SwitchOutcome::AwaitingConfirmation));
            }
            Ok(SwitchStep::Prepare { target }) => self.prepare_target(target, reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn confirm_switch(&mut self, confirmed: bool, reply: Reply<Result<SwitchOutcome>>) {
        let outgoing = self.switch.active().cloned();
        match self.switch.confirm(confirmed) {
            Ok(ConfirmStep::Cancelled { target }) => {
                info!(target = %target, "Switch declined");
                let _ = reply.send(Ok(SwitchOutcome::Cancelled));
            }
            Ok(ConfirmStep::Pause { .. }) => {
                let outgoing = outgoing.and_then(|id| self.registry.get(&id).ok().map(|h| (id, h.conversation())));
                match outgoing {
                    Some((session_id, conversation)) => {
                        self.spawn_engine_call(
                            session_id,
                            conversation,
                            None,
                            BackgroundOp::SwitchPause(reply),
                            |c| c.pause(),
                        );
                    }
                    None => self.finish_switch_pause(reply),
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn finish_switch_pause(&mut self, reply: Reply<Result<SwitchOutcome>>) {
        match self.switch.paused() {
            Ok(target) => self.prepare_target(target, reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn prepare_target(&mut self, target: SessionId, reply: Reply<Result<SwitchOutcome>>) {
        self.registry.clear_current();
        self.with_session(target, AfterOpen::Prepare(reply));
    }

    /// Roll back to the previous session after `target` could not be prepared
    fn switch_failed(&mut self, target: SessionId, e: Error) -> Error {
        let restored = self.switch.fail();
        if let Some(previous) = &restored {
            let _ = self.registry.attach(previous);
        }
        error!(target = %target, restored = ?restored, "Switch failed: {}", e);
        emit(
            &self.events,
            &target,
            SessionEvent::error("Switch Error", format!("Failed to switch conversation: {}", e)),
        );
        Error::SwitchPreparation {
            target,
            reason: e.to_string(),
        }
    }

    /// Attach the opened `target` and complete the switch
    fn attach_target(&mut self, target: SessionId) -> Result<SwitchOutcome> {
        let policy = self.policy;
        let prepared = self.registry.get_mut(&target).map(|handle| {
            if !handle.has_live_worker() {
                handle.update_state(|state| state.reset_transient());
            }
            handle.set_policy(policy);
            (handle.conversation(), handle.state().clone())
        });

        let (conversation, state) = match prepared.and_then(|prepared| {
            self.registry.attach(&target)?;
            Ok(prepared)
        }) {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.switch_failed(target, e)),
        };

        self.push_policy(&target, conversation, policy);
        let previous = self.switch.complete()?;
        info!(target = %target, previous = ?previous, "Switched session");

        emit(
            &self.events,
            &target,
            SessionEvent::status_changed(state.status, state.pending_action_count),
        );
        emit(
            &self.events,
            &target,
            SessionEvent::Switched {
                previous: previous.clone(),
            },
        );
        emit(
            &self.events,
            &target,
            SessionEvent::info("Switched", format!("Resumed conversation {}", short_id(&target))),
        );
        Ok(SwitchOutcome::Switched { previous })
    }

    fn cancel(&mut self, session_id: SessionId, timeout: Duration, reply: Reply<Result<CancelOutcome>>) {
        let Ok(handle) = self.registry.get_mut(&session_id) else {
            let _ = reply.send(Ok(CancelOutcome::NotRunning));
            return;
        };

        if handle.is_cancelling() {
            debug!(session_id = %session_id, "Cancel already in progress, waiting on it");
            self.cancel_waiters.entry(session_id).or_default().push(reply);
            return;
        }

        let Some((epoch, join)) = handle.take_for_cancel() else {
            debug!(session_id = %session_id, "Nothing to cancel");
            let _ = reply.send(Ok(CancelOutcome::NotRunning));
            return;
        };

        info!(session_id = %session_id, epoch, ?timeout, "Cancelling turn");
        let conversation = handle.conversation();
        self.cancel_waiters.entry(session_id.clone()).or_default().push(reply);
        tokio::spawn(wait_for_cancel(
            session_id,
            epoch,
            conversation,
            join,
            timeout,
            self.control_tx.clone(),
        ));
    }

    fn create_session(&mut self) -> Result<SessionId> {
        if let Some(active) = self.switch.active().cloned()
            && self.is_running(&active)
        {
            emit(
                &self.events,
                &active,
                SessionEvent::error(
                    "New Conversation Error",
                    "Cannot start a new conversation while one is running. Please wait for the current conversation to complete or pause it.",
                ),
            );
            return Err(Error::SessionBusy(active));
        }

        let session_id = Uuid::new_v4().to_string();
        let previous = self.switch.start_new(session_id.clone())?;
        self.registry.clear_current();
        info!(session_id = %session_id, previous = ?previous, "Created session");

        emit(&self.events, &session_id, SessionEvent::Created);
        emit(
            &self.events,
            &session_id,
            SessionEvent::info("New Conversation", "Started a new conversation"),
        );
        Ok(session_id)
    }

    fn condense(&mut self, session_id: SessionId, reply: Reply<Result<()>>) {
        let Ok(handle) = self.registry.get(&session_id) else {
            emit(
                &self.events,
                &session_id,
                SessionEvent::warning("Condensation Error", "No conversation available to condense"),
            );
            let _ = reply.send(Err(Error::SessionNotFound(session_id)));
            return;
        };

        if handle.has_live_worker() || handle.state().is_active() {
            emit(
                &self.events,
                &session_id,
                SessionEvent::warning("Condensation Error", "Cannot condense while conversation is running."),
            );
            let _ = reply.send(Err(Error::SessionBusy(session_id)));
            return;
        }

        let conversation = handle.conversation();
        let gate = handle.step_gate();
        emit(
            &self.events,
            &session_id,
            SessionEvent::info(
                "Condensation Started",
                "Conversation condensation will be completed shortly...",
            ),
        );
        self.spawn_engine_call(session_id, conversation, Some(gate), BackgroundOp::Condense(reply), |c| {
            c.condense()
        });
    }

    fn summary(&self, session_id: SessionId, reply: Reply<Result<ConversationSummary>>) {
        let conversation = match self.registry.get(&session_id) {
            Ok(handle) => handle.conversation(),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        tokio::spawn(async move {
            let result = engine_call(conversation, None, |c| Ok(ConversationSummary::from_events(&c.events()))).await;
            let _ = reply.send(result);
        });
    }

    fn spawn_engine_call<F>(
        &self,
        session_id: SessionId,
        conversation: Arc<dyn Conversation>,
        step_gate: Option<Arc<Semaphore>>,
        op: BackgroundOp,
        call: F,
    ) where
        F: FnOnce(&dyn Conversation) -> Result<()> + Send + 'static,
    {
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            let result = engine_call(conversation, step_gate, call).await;
            let _ = control_tx.send(ControlMsg::Completed {
                session_id,
                op,
                result,
            });
        });
    }

    fn on_control_message(&mut self, message: ControlMsg) {
        match message {
            ControlMsg::Opened {
                session_id,
                policy,
                result,
            } => self.on_opened(session_id, policy, result),
            ControlMsg::Completed {
                session_id,
                op,
                result,
            } => self.on_completed(session_id, op, result),
            ControlMsg::CancelSettled {
                session_id,
                epoch,
                forced,
            } => self.on_cancel_settled(session_id, epoch, forced),
        }
    }

    fn on_completed(&mut self, session_id: SessionId, op: BackgroundOp, result: Result<()>) {
        match op {
            BackgroundOp::Enqueue(reply) => {
                let result = result.map(|_| SubmitOutcome::Queued);
                if let Err(e) = &result {
                    warn!(session_id = %session_id, "Failed to queue message: {}", e);
                    emit(
                        &self.events,
                        &session_id,
                        SessionEvent::error("Message Error", format!("Failed to queue message: {}", e)),
                    );
                }
                let _ = reply.send(result);
            }
            BackgroundOp::Pause(reply) => {
                let result = result.map(|_| PauseOutcome::Requested);
                if let Err(e) = &result {
                    warn!(session_id = %session_id, "Pause failed: {}", e);
                    emit(
                        &self.events,
                        &session_id,
                        SessionEvent::error("Pause Error", format!("Failed to pause conversation: {}", e)),
                    );
                }
                let _ = reply.send(result);
            }
            BackgroundOp::Condense(reply) => {
                match &result {
                    Ok(()) => {
                        info!(session_id = %session_id, "Condensation complete");
                        emit(
                            &self.events,
                            &session_id,
                            SessionEvent::info(
                                "Condensation Complete",
                                "Conversation history has been condensed successfully",
                            ),
                        );
                    }
                    Err(e) => {
                        error!(session_id = %session_id, "Condensation failed: {}", e);
                        emit(
                            &self.events,
                            &session_id,
                            SessionEvent::error("Condensation Error", format!("Failed to condense conversation: {}", e)),
                        );
                    }
                }
                let _ = reply.send(result);
            }
            BackgroundOp::SwitchPause(reply) => {
                if let Err(e) = &result {
                    warn!(session_id = %session_id, "Pause before switch failed: {}", e);
                    emit(
                        &self.events,
                        &session_id,
                        SessionEvent::warning("Switch", format!("Failed to pause conversation: {}", e)),
                    );
                }
                self.finish_switch_pause(reply);
            }
        }
    }

    fn on_cancel_settled(&mut self, session_id: SessionId, epoch: u64, forced: bool) {
        let outcome = if forced {
            CancelOutcome::Forced
        } else {
            CancelOutcome::Cooperative
        };

        if let Ok(handle) = self.registry.get_mut(&session_id) {
            handle.finish_cancel(epoch);
            if handle.update_state(|state| state.force_settle()) {
                emit(
                    &self.events,
                    &session_id,
                    SessionEvent::status_changed(ExecutionStatus::Paused, 0),
                );
            }
            let status = handle.state().status;
            emit(&self.events, &session_id, SessionEvent::TurnFinished { status });
        }
        info!(session_id = %session_id, ?outcome, "Cancel settled");

        for reply in self.cancel_waiters.remove(&session_id).unwrap_or_default() {
            let _ = reply.send(Ok(outcome));
        }
        self.start_follow_up(&session_id);
    }

    fn on_worker_message(&mut self, message: WorkerMessage) {
        let WorkerMessage {
            session_id,
            epoch,
            update,
        } = message;

        let Ok(handle) = self.registry.get_mut(&session_id) else {
            debug!(session_id = %session_id, "Update for unknown session");
            return;
        };
        if !handle.accepts_epoch(epoch) {
            debug!(session_id = %session_id, epoch, "Ignoring update from stale worker");
            return;
        }

        match update {
            WorkerUpdate::Status {
                status,
                pending_action_count,
            } => {
                // Workers report these only as their last word
                if matches!(status, ExecutionStatus::Finished | ExecutionStatus::Paused) {
                    handle.mark_settled(epoch);
                }
                match handle.update_state(|state| state.transition(status, pending_action_count)) {
                    Ok(true) => emit(
                        &self.events,
                        &session_id,
                        SessionEvent::status_changed(status, pending_action_count),
                    ),
                    Ok(false) => {}
                    Err(e) => warn!(session_id = %session_id, "Dropping worker status: {}", e),
                }
            }
            WorkerUpdate::AwaitingDecision { actions } => {
                let count = actions.len();
                match handle.update_state(|state| state.transition(ExecutionStatus::WaitingForConfirmation, count)) {
                    Ok(_) => {
                        emit(
                            &self.events,
                            &session_id,
                            SessionEvent::status_changed(ExecutionStatus::WaitingForConfirmation, count),
                        );
                        emit(&self.events, &session_id, SessionEvent::ConfirmationRequired { actions });
                    }
                    Err(e) => warn!(session_id = %session_id, "Dropping escalation: {}", e),
                }
            }
            WorkerUpdate::Metrics(metrics) => {
                handle.update_state(|state| state.metrics = metrics.clone());
                emit(&self.events, &session_id, SessionEvent::MetricsUpdated { metrics });
            }
            WorkerUpdate::PolicyChanged(policy) => {
                handle.set_policy(policy);
                if self.switch.active() == Some(&session_id) {
                    self.policy = policy;
                }
                info!(session_id = %session_id, %policy, "Policy changed by decision");
                emit(&self.events, &session_id, SessionEvent::PolicyChanged { policy });
            }
            WorkerUpdate::Notice {
                title,
                message,
                severity,
            } => emit(
                &self.events,
                &session_id,
                SessionEvent::notification(title, message, severity),
            ),
            WorkerUpdate::Exited => {
                if handle.worker_exited(epoch) {
                    if handle.update_state(|state| state.force_settle()) {
                        warn!(session_id = %session_id, "Worker exited while active, settling paused");
                        emit(
                            &self.events,
                            &session_id,
                            SessionEvent::status_changed(ExecutionStatus::Paused, 0),
                        );
                    }
                    let status = handle.state().status;
                    debug!(session_id = %session_id, %status, "Worker exited");
                    emit(&self.events, &session_id, SessionEvent::TurnFinished { status });
                    self.start_follow_up(&session_id);
                }
            }
        }
    }
}

/// Pause the worker's engine, give it `timeout` to stop, then abort it
async fn wait_for_cancel(
    session_id: SessionId,
    epoch: u64,
    conversation: Arc<dyn Conversation>,
    mut join: JoinHandle<()>,
    timeout: Duration,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
) {
    // Fire and forget; a wedged engine must not hold up the timer
    let pause_session = session_id.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = conversation.pause() {
            warn!(session_id = %pause_session, "Pause during cancel failed: {}", e);
        }
    });

    let forced = match tokio::time::timeout(timeout, &mut join).await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, "Worker ended abnormally: {}", e);
            false
        }
        Err(_) => {
            warn!(session_id = %session_id, ?timeout, "Worker did not stop in time, aborting");
            join.abort();
            match join.await {
                Err(e) if e.is_cancelled() => debug!(session_id = %session_id, "Worker task aborted"),
                Err(e) => warn!(session_id = %session_id, "Worker ended abnormally: {}", e),
                Ok(()) => {}
            }
            true
        }
    };

    let _ = control_tx.send(ControlMsg::CancelSettled {
        session_id,
        epoch,
        forced,
    });
}
