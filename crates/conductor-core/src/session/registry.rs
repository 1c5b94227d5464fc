//! Session registry
//!
//! Owns one [`SessionHandle`] per session id for the lifetime of the process.
//! A handle bundles the engine conversation, the execution record and the
//! worker slot that keeps at most one turn running per session.
//!
//! Opening a conversation may do I/O, so the registry never awaits the
//! factory itself. [`SessionRegistry::get_or_create`] hands out the open as a
//! future for the caller to run elsewhere, and [`SessionRegistry::finish_open`]
//! registers what it produced.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::state::SessionExecutionState;
use super::types::SessionId;
use super::worker::{ExecutionWorker, WorkerSender};
use crate::approval::ConfirmationController;
use crate::engine::{Conversation, ConversationFactory};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;

/// Who is executing for a session right now
#[derive(Debug, Default)]
enum WorkerSlot {
    #[default]
    Idle,
    Active {
        epoch: u64,
        join: JoinHandle<()>,
        /// The worker reported its final status and is only exiting now
        settled: bool,
    },
    /// The join handle went to a cancel waiter
    Cancelling { epoch: u64 },
}

/// Everything the coordinator holds for one session
pub struct SessionHandle {
    id: SessionId,
    conversation: Arc<dyn Conversation>,
    state: SessionExecutionState,
    state_tx: watch::Sender<SessionExecutionState>,
    policy_tx: watch::Sender<ConfirmationPolicy>,
    step_gate: Arc<Semaphore>,
    worker: WorkerSlot,
    next_epoch: u64,
    /// Messages that arrived too late for the worker holding the slot
    parked: Vec<String>,
}

impl SessionHandle {
    pub fn new(id: SessionId, conversation: Arc<dyn Conversation>, policy: ConfirmationPolicy) -> Self {
        let state = SessionExecutionState::new(policy);
        let (state_tx, _) = watch::channel(state.clone());
        let (policy_tx, _) = watch::channel(policy);
        Self {
            id,
            conversation,
            state,
            state_tx,
            policy_tx,
            step_gate: Arc::new(Semaphore::new(1)),
            worker: WorkerSlot::Idle,
            next_epoch: 1,
            parked: Vec::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn conversation(&self) -> Arc<dyn Conversation> {
        self.conversation.clone()
    }

    pub fn state(&self) -> &SessionExecutionState {
        &self.state
    }

    pub fn step_gate(&self) -> Arc<Semaphore> {
        self.step_gate.clone()
    }

    /// Receiver of state snapshots, starting with the current one
    pub fn subscribe(&self) -> watch::Receiver<SessionExecutionState> {
        self.state_tx.subscribe()
    }

    pub fn has_live_worker(&self) -> bool {
        !matches!(self.worker, WorkerSlot::Idle)
    }

    /// Epoch of the worker currently holding the slot
    pub fn worker_epoch(&self) -> Option<u64> {
        match self.worker {
            WorkerSlot::Idle => None,
            WorkerSlot::Active { epoch, .. } | WorkerSlot::Cancelling { epoch } => Some(epoch),
        }
    }

    /// Whether the worker in the slot will not look at the engine again
    ///
    /// True once it reported its final status, or while it is being cancelled.
    pub fn is_winding_down(&self) -> bool {
        matches!(
            self.worker,
            WorkerSlot::Active { settled: true, .. } | WorkerSlot::Cancelling { .. }
        )
    }

    /// Note that the worker for `epoch` reported its final status
    pub fn mark_settled(&mut self, epoch: u64) {
        if let WorkerSlot::Active { epoch: e, settled, .. } = &mut self.worker
            && *e == epoch
        {
            *settled = true;
        }
    }

    /// Hold a message for the turn after the current one
    pub fn park_message(&mut self, text: String) {
        self.parked.push(text);
    }

    pub fn take_parked(&mut self) -> Vec<String> {
        std::mem::take(&mut self.parked)
    }

    /// Whether updates stamped with `epoch` still belong to this session's worker
    pub fn accepts_epoch(&self, epoch: u64) -> bool {
        self.worker_epoch() == Some(epoch)
    }

    /// Mutate the record and publish the result to watchers
    pub fn update_state<R>(&mut self, f: impl FnOnce(&mut SessionExecutionState) -> R) -> R {
        let result = f(&mut self.state);
        self.state_tx.send_replace(self.state.clone());
        result
    }

    /// Install a policy for this session and for its worker's next check
    pub fn set_policy(&mut self, policy: ConfirmationPolicy) {
        self.update_state(|state| state.policy = policy);
        self.policy_tx.send_replace(policy);
    }

    /// Spawn a worker for one turn
    pub fn launch_worker(
        &mut self,
        controller: Arc<ConfirmationController>,
        updates: WorkerSender,
        messages: Vec<String>,
    ) -> Result<u64> {
        if self.has_live_worker() {
            return Err(Error::SessionBusy(self.id.clone()));
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let worker = ExecutionWorker::new(
            self.id.clone(),
            epoch,
            self.conversation.clone(),
            controller,
            self.policy_tx.subscribe(),
            self.step_gate.clone(),
            updates,
            messages,
        );
        let join = tokio::spawn(worker.run());
        self.worker = WorkerSlot::Active {
            epoch,
            join,
            settled: false,
        };
        debug!(session_id = %self.id, epoch, "Worker launched");
        Ok(epoch)
    }

    /// Hand the running worker over to a cancel waiter
    ///
    /// The slot stays occupied until [`SessionHandle::finish_cancel`].
    pub fn take_for_cancel(&mut self) -> Option<(u64, JoinHandle<()>)> {
        match std::mem::take(&mut self.worker) {
            WorkerSlot::Active { epoch, join, .. } => {
                self.worker = WorkerSlot::Cancelling { epoch };
                Some((epoch, join))
            }
            other => {
                self.worker = other;
                None
            }
        }
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(self.worker, WorkerSlot::Cancelling { .. })
    }

    /// Release the slot once the cancel waiter saw the worker end
    pub fn finish_cancel(&mut self, epoch: u64) -> bool {
        if matches!(self.worker, WorkerSlot::Cancelling { epoch: e } if e == epoch) {
            self.worker = WorkerSlot::Idle;
            return true;
        }
        false
    }

    /// Release the slot after the worker reported its exit
    ///
    /// A worker being cancelled keeps the slot; the cancel waiter releases it.
    pub fn worker_exited(&mut self, epoch: u64) -> bool {
        if matches!(self.worker, WorkerSlot::Active { epoch: e, .. } if e == epoch) {
            self.worker = WorkerSlot::Idle;
            return true;
        }
        false
    }
}

/// Conversation being opened by the factory
pub type OpenFuture = BoxFuture<'static, Result<Arc<dyn Conversation>>>;

/// Answer to [`SessionRegistry::get_or_create`]
pub enum Lookup<'a> {
    Ready(&'a mut SessionHandle),
    /// First request for this id; run the future and pass its output to
    /// [`SessionRegistry::finish_open`]
    Open(OpenFuture),
    /// An earlier request is still opening this id
    Opening,
}

/// All sessions known to the coordinator plus the attached one
pub struct SessionRegistry {
    factory: Arc<dyn ConversationFactory>,
    handles: HashMap<SessionId, SessionHandle>,
    opening: HashSet<SessionId>,
    current: Option<SessionId>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ConversationFactory>) -> Self {
        Self {
            factory,
            handles: HashMap::new(),
            opening: HashSet::new(),
            current: None,
        }
    }

    /// Resolve the handle for `session_id`, or start opening its conversation
    ///
    /// Only the first request for an unknown id gets [`Lookup::Open`]; the
    /// factory is never asked twice for one id while an open is outstanding
    /// or after it succeeded.
    pub fn get_or_create(&mut self, session_id: &str, policy: ConfirmationPolicy) -> Lookup<'_> {
        if self.opening.contains(session_id) {
            return Lookup::Opening;
        }
        if let Some(handle) = self.handles.get_mut(session_id) {
            return Lookup::Ready(handle);
        }

        info!("Opening conversation for session: {}", session_id);
        self.opening.insert(session_id.to_string());
        let factory = self.factory.clone();
        let id = session_id.to_string();
        Lookup::Open(Box::pin(async move { factory.open(&id, policy).await }))
    }

    pub fn is_opening(&self, session_id: &str) -> bool {
        self.opening.contains(session_id)
    }

    /// Register the outcome of an open started by [`SessionRegistry::get_or_create`]
    ///
    /// A failed open registers nothing, so the next request tries again.
    pub fn finish_open(
        &mut self,
        session_id: &str,
        opened: Result<Arc<dyn Conversation>>,
        policy: ConfirmationPolicy,
    ) -> Result<&mut SessionHandle> {
        self.opening.remove(session_id);
        let conversation = opened?;
        let id = session_id.to_string();
        Ok(self
            .handles
            .entry(id.clone())
            .or_insert_with(|| SessionHandle::new(id, conversation, policy)))
    }

    pub fn get(&self, session_id: &str) -> Result<&SessionHandle> {
        self.handles
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn get_mut(&mut self, session_id: &str) -> Result<&mut SessionHandle> {
        self.handles
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.handles.contains_key(session_id)
    }

    /// Known session ids, sorted
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Make an existing handle the attached one
    pub fn attach(&mut self, session_id: &str) -> Result<()> {
        if !self.contains(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.current = Some(session_id.to_string());
        Ok(())
    }

    /// Detach the attached handle without dropping it
    pub fn clear_current(&mut self) -> Option<SessionId> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    pub fn current_handle(&self) -> Option<&SessionHandle> {
        self.current.as_deref().and_then(|id| self.handles.get(id))
    }

    /// Drop a session for good
    pub fn remove(&mut self, session_id: &str) -> Result<SessionHandle> {
        if self.get(session_id)?.has_live_worker() {
            return Err(Error::InvariantViolation(format!(
                "cannot remove session {} while its worker is live",
                session_id
            )));
        }
        if self.current.as_deref() == Some(session_id) {
            self.current = None;
        }
        info!("Removing session: {}", session_id);
        self.handles
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Handles with a worker in the slot
    pub fn live_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .handles
            .values()
            .filter(|h| h.has_live_worker())
            .map(|h| h.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
