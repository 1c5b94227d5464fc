//! Shared helpers for coordinator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use conductor_core::{
    ConfirmationPolicy, ConfirmationPrompt, Coordinator, CoordinatorSettings, Decision, Error, EventReceiver,
    PendingAction, Result, ScriptedFactory, SessionEvent, SessionId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// What a [`QueuedPrompt`] does once its decisions run out
pub enum WhenEmpty {
    Fail,
    Hang,
}

/// Prompt answering escalations from a fixed queue of decisions
pub struct QueuedPrompt {
    decisions: Mutex<VecDeque<Decision>>,
    requests: Mutex<Vec<(SessionId, Vec<PendingAction>)>>,
    when_empty: WhenEmpty,
}

impl QueuedPrompt {
    pub fn new(decisions: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            requests: Mutex::new(Vec::new()),
            when_empty: WhenEmpty::Fail,
        })
    }

    /// Never answers
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            when_empty: WhenEmpty::Hang,
        })
    }

    pub fn requests(&self) -> Vec<(SessionId, Vec<PendingAction>)> {
        self.requests.lock().clone()
    }

    pub fn escalations(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ConfirmationPrompt for QueuedPrompt {
    async fn request_decision(&self, session_id: &SessionId, actions: Vec<PendingAction>) -> Result<Decision> {
        self.requests.lock().push((session_id.clone(), actions));
        let next = self.decisions.lock().pop_front();
        match (next, &self.when_empty) {
            (Some(decision), _) => Ok(decision),
            (None, WhenEmpty::Fail) => Err(Error::Escalation("no decision queued".to_string())),
            (None, WhenEmpty::Hang) => {
                futures::future::pending::<()>().await;
                Err(Error::Escalation("unreachable".to_string()))
            }
        }
    }
}

pub fn start(
    factory: Arc<ScriptedFactory>,
    prompt: Arc<dyn ConfirmationPrompt>,
    policy: ConfirmationPolicy,
) -> (Coordinator, EventReceiver) {
    start_with(factory, prompt, CoordinatorSettings::default().with_policy(policy))
}

pub fn start_with(
    factory: Arc<ScriptedFactory>,
    prompt: Arc<dyn ConfirmationPrompt>,
    settings: CoordinatorSettings,
) -> (Coordinator, EventReceiver) {
    Coordinator::new(factory, prompt, settings)
}

/// Collect events until one satisfies `done`, which is included
pub async fn wait_for_event<F>(events: &mut EventReceiver, mut done: F) -> Vec<(SessionId, SessionEvent)>
where
    F: FnMut(&str, &SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    let found = tokio::time::timeout(WAIT, async {
        while let Some((session_id, event)) = events.recv().await {
            let matched = done(&session_id, &event);
            seen.push((session_id, event));
            if matched {
                return true;
            }
        }
        false
    })
    .await;

    match found {
        Ok(true) => seen,
        _ => panic!("expected event never arrived; saw {:#?}", seen),
    }
}

/// Collect events until `session_id`'s worker lets go of the session
pub async fn turn_finished(events: &mut EventReceiver, session_id: &str) -> Vec<(SessionId, SessionEvent)> {
    wait_for_event(events, |id, event| {
        id == session_id && matches!(event, SessionEvent::TurnFinished { .. })
    })
    .await
}

/// Everything already published
pub fn drain(events: &mut EventReceiver) -> Vec<(SessionId, SessionEvent)> {
    let mut seen = Vec::new();
    while let Ok(item) = events.try_recv() {
        seen.push(item);
    }
    seen
}

pub fn count_titled(seen: &[(SessionId, SessionEvent)], title: &str) -> usize {
    seen.iter().filter(|(_, event)| event.title() == Some(title)).count()
}

pub fn statuses_for(seen: &[(SessionId, SessionEvent)], session_id: &str) -> Vec<conductor_core::ExecutionStatus> {
    seen.iter()
        .filter(|(id, _)| id == session_id)
        .filter_map(|(_, event)| match event {
            SessionEvent::StatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

/// Poll `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached in {:?}", WAIT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
