//! Deterministic scripted engine
//!
//! A [`ScriptedConversation`] plays back a [`Script`] one step per `run()`
//! call. It stands in for a real agent engine in the console front end and
//! in tests, and records enough about how it was driven (run calls, the
//! concurrent-run high-water mark, messages, pauses) to assert on.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use super::events::{self, EngineEvent, PendingAction};
use super::{Conversation, ConversationFactory};
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;
use crate::session::{ExecutionStatus, MetricsSnapshot, SessionId};

const DEFAULT_REPLY: &str = "Done.";
const STALL_SLICE: Duration = Duration::from_millis(10);

/// Usage charged for every completed step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// One scripted engine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Reply and finish the turn
    Finish {
        #[serde(default = "default_reply")]
        reply: String,
    },
    /// Propose actions and wait for confirmation
    Confirm { actions: Vec<PendingAction> },
    /// Block the calling thread, then carry on with the next step
    Stall {
        millis: u64,
        /// Whether a pause request interrupts the stall
        #[serde(default = "default_cooperative")]
        cooperative: bool,
    },
    /// Raise an engine error
    Fail { message: String },
    /// Settle in an arbitrary status
    Report { status: ExecutionStatus },
}

fn default_reply() -> String {
    DEFAULT_REPLY.to_string()
}

fn default_cooperative() -> bool {
    true
}

impl ScriptStep {
    pub fn finish(reply: impl Into<String>) -> Self {
        Self::Finish { reply: reply.into() }
    }

    pub fn confirm(actions: Vec<PendingAction>) -> Self {
        Self::Confirm { actions }
    }

    pub fn stall(millis: u64) -> Self {
        Self::Stall {
            millis,
            cooperative: true,
        }
    }

    /// A stall that ignores pause requests
    pub fn stall_uncooperative(millis: u64) -> Self {
        Self::Stall {
            millis,
            cooperative: false,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }

    pub fn report(status: ExecutionStatus) -> Self {
        Self::Report { status }
    }
}

/// Playback script for a [`ScriptedConversation`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
    /// Start over once the steps run out
    pub repeat: bool,
    pub usage: StepUsage,
    /// Actions already awaiting confirmation when the conversation opens
    pub pending: Vec<PendingAction>,
    /// When set, `condense()` fails with this message
    pub condense_error: Option<String>,
    /// When set, `send_message()` fails with this message
    pub message_error: Option<String>,
    /// When set, `pause()` fails with this message
    pub pause_error: Option<String>,
}

impl Script {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Single-step script that finishes with `reply`
    pub fn finish(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::finish(reply)])
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn with_usage(mut self, usage: StepUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_pending(mut self, pending: Vec<PendingAction>) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_condense_error(mut self, message: impl Into<String>) -> Self {
        self.condense_error = Some(message.into());
        self
    }

    pub fn with_message_error(mut self, message: impl Into<String>) -> Self {
        self.message_error = Some(message.into());
        self
    }

    pub fn with_pause_error(mut self, message: impl Into<String>) -> Self {
        self.pause_error = Some(message.into());
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid script: {}", e)))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a script file, JSON if the extension says so and TOML otherwise
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }
}

struct Inner {
    script: Script,
    cursor: usize,
    status: ExecutionStatus,
    events: Vec<EngineEvent>,
    metrics: MetricsSnapshot,
    issued: HashMap<String, usize>,
    sent_messages: Vec<String>,
    last_policy: Option<ConfirmationPolicy>,
}

impl Inner {
    fn next_step(&mut self) -> Option<ScriptStep> {
        if self.cursor >= self.script.steps.len() {
            if !self.script.repeat || self.script.steps.is_empty() {
                return None;
            }
            self.cursor = 0;
        }
        let step = self.script.steps.get(self.cursor).cloned();
        self.cursor += 1;
        step
    }

    fn record_usage(&mut self) {
        let usage = &self.script.usage;
        self.metrics.steps += 1;
        self.metrics.prompt_tokens += usage.prompt_tokens;
        self.metrics.completion_tokens += usage.completion_tokens;
        self.metrics.accumulated_cost += usage.cost;
    }

    /// Log an action, renaming repeated ids so each stays matchable
    fn propose(&mut self, mut action: PendingAction) {
        let seen = self.issued.entry(action.tool_call_id.clone()).or_insert(0);
        if *seen > 0 {
            action.tool_call_id = format!("{}#{}", action.tool_call_id, seen);
        }
        *seen += 1;
        self.events.push(EngineEvent::Action { action });
    }
}

/// Conversation that plays back a [`Script`]
pub struct ScriptedConversation {
    inner: Mutex<Inner>,
    pause_requested: AtomicBool,
    active_runs: AtomicUsize,
    max_concurrent_runs: AtomicUsize,
    run_calls: AtomicUsize,
    pause_calls: AtomicUsize,
    condense_calls: AtomicUsize,
}

struct RunGuard<'a>(&'a AtomicUsize);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedConversation {
    pub fn new(script: Script) -> Self {
        let mut inner = Inner {
            script,
            cursor: 0,
            status: ExecutionStatus::Idle,
            events: Vec::new(),
            metrics: MetricsSnapshot::default(),
            issued: HashMap::new(),
            sent_messages: Vec::new(),
            last_policy: None,
        };
        let pending = std::mem::take(&mut inner.script.pending);
        if !pending.is_empty() {
            for action in pending {
                inner.propose(action);
            }
            inner.status = ExecutionStatus::WaitingForConfirmation;
        }

        Self {
            inner: Mutex::new(inner),
            pause_requested: AtomicBool::new(false),
            active_runs: AtomicUsize::new(0),
            max_concurrent_runs: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            pause_calls: AtomicUsize::new(0),
            condense_calls: AtomicUsize::new(0),
        }
    }

    /// Whether a `run()` call is executing right now
    pub fn is_running(&self) -> bool {
        self.active_runs.load(Ordering::SeqCst) > 0
    }

    /// Most `run()` calls ever observed executing at once
    pub fn max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    pub fn condense_calls(&self) -> usize {
        self.condense_calls.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.inner.lock().sent_messages.clone()
    }

    pub fn last_policy(&self) -> Option<ConfirmationPolicy> {
        self.inner.lock().last_policy
    }

    fn enter_run(&self) -> RunGuard<'_> {
        let now = self.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_runs.fetch_max(now, Ordering::SeqCst);
        RunGuard(&self.active_runs)
    }

    /// Sleep for `millis`; returns true if a pause cut the stall short
    fn stall(&self, millis: u64, cooperative: bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(millis);
        loop {
            if cooperative && self.pause_requested.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(STALL_SLICE.min(deadline - now));
        }
    }
}

impl Conversation for ScriptedConversation {
    fn run(&self) -> Result<()> {
        let _guard = self.enter_run();
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock();
            let pending = events::unmatched_actions(&inner.events);
            if !pending.is_empty() {
                if inner.status != ExecutionStatus::WaitingForConfirmation {
                    // Unresolved actions from an earlier pause need a fresh decision
                    inner.status = ExecutionStatus::WaitingForConfirmation;
                    return Ok(());
                }
                for action in pending {
                    inner.events.push(EngineEvent::Observation {
                        output: format!("{} completed", action.tool_name),
                        tool_call_id: action.tool_call_id,
                    });
                }
            }
            inner.status = ExecutionStatus::Running;
        }

        loop {
            let step = self.inner.lock().next_step();
            debug!(?step, "Scripted step");
            match step {
                None => {
                    let mut inner = self.inner.lock();
                    inner.events.push(EngineEvent::AgentMessage {
                        content: DEFAULT_REPLY.to_string(),
                    });
                    inner.record_usage();
                    inner.status = ExecutionStatus::Finished;
                    return Ok(());
                }
                Some(ScriptStep::Stall { millis, cooperative }) => {
                    if self.stall(millis, cooperative) {
                        let mut inner = self.inner.lock();
                        inner.record_usage();
                        inner.status = ExecutionStatus::Paused;
                        return Ok(());
                    }
                }
                Some(ScriptStep::Finish { reply }) => {
                    let mut inner = self.inner.lock();
                    inner.events.push(EngineEvent::AgentMessage { content: reply });
                    inner.record_usage();
                    inner.status = ExecutionStatus::Finished;
                    return Ok(());
                }
                Some(ScriptStep::Confirm { actions }) => {
                    let mut inner = self.inner.lock();
                    for action in actions {
                        inner.propose(action);
                    }
                    inner.record_usage();
                    inner.status = ExecutionStatus::WaitingForConfirmation;
                    return Ok(());
                }
                Some(ScriptStep::Fail { message }) => {
                    self.inner.lock().status = ExecutionStatus::Paused;
                    return Err(Error::Engine(message));
                }
                Some(ScriptStep::Report { status }) => {
                    let mut inner = self.inner.lock();
                    inner.record_usage();
                    inner.status = status;
                    return Ok(());
                }
            }
        }
    }

    fn pause(&self) -> Result<()> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.inner.lock().script.pause_error {
            return Err(Error::Engine(message.clone()));
        }
        if self.is_running() {
            self.pause_requested.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.status != ExecutionStatus::Finished {
            inner.status = ExecutionStatus::Paused;
        }
        Ok(())
    }

    fn send_message(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(message) = &inner.script.message_error {
            return Err(Error::Engine(message.clone()));
        }
        inner.events.push(EngineEvent::UserMessage {
            content: text.to_string(),
        });
        inner.sent_messages.push(text.to_string());
        if inner.status == ExecutionStatus::Finished {
            inner.status = ExecutionStatus::Idle;
        }
        Ok(())
    }

    fn condense(&self) -> Result<()> {
        self.condense_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if let Some(message) = &inner.script.condense_error {
            return Err(Error::Engine(message.clone()));
        }
        let summary = format!("{} events condensed", inner.events.len());
        inner.events.push(EngineEvent::Condensation { summary });
        Ok(())
    }

    fn set_confirmation_policy(&self, policy: ConfirmationPolicy) -> Result<()> {
        self.inner.lock().last_policy = Some(policy);
        Ok(())
    }

    fn reject_pending_actions(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        for action in events::unmatched_actions(&inner.events) {
            inner.events.push(EngineEvent::Rejection {
                tool_call_id: action.tool_call_id,
                reason: reason.to_string(),
            });
        }
        inner.status = ExecutionStatus::Idle;
        Ok(())
    }

    fn execution_status(&self) -> ExecutionStatus {
        self.inner.lock().status
    }

    fn events(&self) -> Vec<EngineEvent> {
        self.inner.lock().events.clone()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.inner.lock().metrics.clone()
    }
}

/// Factory handing out [`ScriptedConversation`]s
///
/// Every session plays the default script unless one was registered for its
/// id. Opened conversations stay reachable through [`ScriptedFactory::conversation`].
#[derive(Default)]
pub struct ScriptedFactory {
    default_script: Script,
    scripts: Mutex<HashMap<SessionId, Script>>,
    failing: Mutex<HashSet<SessionId>>,
    opened: Mutex<HashMap<SessionId, Arc<ScriptedConversation>>>,
    open_delays: Mutex<HashMap<SessionId, Duration>>,
    open_calls: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(default_script: Script) -> Self {
        Self {
            default_script,
            ..Default::default()
        }
    }

    pub fn with_script(self, session_id: impl Into<SessionId>, script: Script) -> Self {
        self.scripts.lock().insert(session_id.into(), script);
        self
    }

    pub fn set_script(&self, session_id: impl Into<SessionId>, script: Script) {
        self.scripts.lock().insert(session_id.into(), script);
    }

    /// Make `open` fail for this id
    pub fn fail_for(&self, session_id: impl Into<SessionId>) {
        self.failing.lock().insert(session_id.into());
    }

    /// Make `open` take `delay` for this id, as a slow store would
    pub fn delay_open(&self, session_id: impl Into<SessionId>, delay: Duration) {
        self.open_delays.lock().insert(session_id.into(), delay);
    }

    pub fn conversation(&self, session_id: &str) -> Option<Arc<ScriptedConversation>> {
        self.opened.lock().get(session_id).cloned()
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationFactory for ScriptedFactory {
    async fn open(&self, session_id: &SessionId, policy: ConfirmationPolicy) -> Result<Arc<dyn Conversation>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delays.lock().get(session_id).copied();
        if let Some(delay) = delay {
            debug!(session_id = %session_id, ?delay, "Delaying open");
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(session_id) {
            return Err(Error::Engine(format!("Cannot open conversation {}", session_id)));
        }

        let script = self
            .scripts
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let conversation = Arc::new(ScriptedConversation::new(script));
        conversation.set_confirmation_policy(policy)?;
        self.opened.lock().insert(session_id.clone(), conversation.clone());

        Ok(conversation)
    }
}
