//! Per-session execution state
//!
//! [`SessionExecutionState`] is written only by the coordinator's control loop
//! and read everywhere else through snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;

/// Engine-side execution status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    WaitingForConfirmation,
    Paused,
    Finished,
}

impl ExecutionStatus {
    /// Closed transition table; self-transitions are handled by the caller
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Finished)
                | (Running, WaitingForConfirmation)
                | (Running, Paused)
                | (WaitingForConfirmation, Running)
                | (WaitingForConfirmation, Paused)
                | (Paused, Running)
                | (Finished, Running)
        )
    }

    /// Running or waiting on a decision
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::WaitingForConfirmation)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Idle => write!(f, "idle"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::WaitingForConfirmation => write!(f, "waiting_for_confirmation"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Usage counters reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub steps: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub accumulated_cost: f64,
}

impl MetricsSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Execution record for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExecutionState {
    pub status: ExecutionStatus,
    pub policy: ConfirmationPolicy,
    pub pending_action_count: usize,
    pub run_started_at: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
}

impl SessionExecutionState {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            status: ExecutionStatus::Idle,
            policy,
            pending_action_count: 0,
            run_started_at: None,
            metrics: MetricsSnapshot::default(),
        }
    }

    /// Move to `next`, recording the pending-action count
    ///
    /// Returns `Ok(false)` for a self-transition, which only refreshes the
    /// pending count. Steps outside the transition table and a
    /// waiting-for-confirmation status without pending actions are refused.
    pub fn transition(&mut self, next: ExecutionStatus, pending_action_count: usize) -> Result<bool> {
        if next == ExecutionStatus::WaitingForConfirmation && pending_action_count == 0 {
            return Err(Error::InvariantViolation(
                "waiting for confirmation requires at least one pending action".to_string(),
            ));
        }
        if next == self.status {
            self.pending_action_count = pending_action_count;
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvariantViolation(format!(
                "illegal status transition {} -> {}",
                self.status, next
            )));
        }

        match next {
            ExecutionStatus::Running if self.status != ExecutionStatus::WaitingForConfirmation => {
                self.run_started_at = Some(Utc::now());
            }
            ExecutionStatus::Finished | ExecutionStatus::Paused => self.run_started_at = None,
            _ => {}
        }
        self.status = next;
        self.pending_action_count = pending_action_count;
        Ok(true)
    }

    /// Return to a fresh idle record, keeping the policy
    pub fn reset_transient(&mut self) {
        *self = Self::new(self.policy);
    }

    /// Settle an active session as paused without going through the table
    ///
    /// Used after a worker was torn down while the record still said running.
    pub fn force_settle(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.status = ExecutionStatus::Paused;
        self.pending_action_count = 0;
        self.run_started_at = None;
        true
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Time since the current run started
    pub fn elapsed(&self) -> Option<Duration> {
        self.run_started_at
            .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
    }
}

impl Default for SessionExecutionState {
    fn default() -> Self {
        Self::new(ConfirmationPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    const ALL: [ExecutionStatus; 5] = [Idle, Running, WaitingForConfirmation, Paused, Finished];

    #[test]
    fn test_transition_table_is_closed() {
        let allowed = [
            (Idle, Running),
            (Running, Finished),
            (Running, WaitingForConfirmation),
            (Running, Paused),
            (WaitingForConfirmation, Running),
            (WaitingForConfirmation, Paused),
            (Paused, Running),
            (Finished, Running),
        ];

        for from in ALL {
            for to in ALL {
                if from == to {
                    continue;
                }
                let mut state = SessionExecutionState::new(ConfirmationPolicy::ConfirmAll);
                state.status = from;
                let result = state.transition(to, 1);
                if allowed.contains(&(from, to)) {
                    assert_eq!(result.unwrap(), true, "{} -> {}", from, to);
                    assert_eq!(state.status, to);
                } else {
                    assert!(matches!(result, Err(Error::InvariantViolation(_))), "{} -> {}", from, to);
                    assert_eq!(state.status, from);
                }
            }
        }
    }

    #[test]
    fn test_self_transition_is_noop() {
        let mut state = SessionExecutionState::default();
        state.transition(Running, 0).unwrap();
        let started = state.run_started_at;
        assert_eq!(state.transition(Running, 0).unwrap(), false);
        assert_eq!(state.run_started_at, started);
    }

    #[test]
    fn test_waiting_requires_pending_actions() {
        let mut state = SessionExecutionState::default();
        state.transition(Running, 0).unwrap();
        assert!(state.transition(WaitingForConfirmation, 0).is_err());
        assert_eq!(state.status, Running);

        assert!(state.transition(WaitingForConfirmation, 2).unwrap());
        assert_eq!(state.pending_action_count, 2);
    }

    #[test]
    fn test_run_timer_spans_confirmation() {
        let mut state = SessionExecutionState::default();
        state.transition(Running, 0).unwrap();
        let started = state.run_started_at;
        assert!(started.is_some());

        state.transition(WaitingForConfirmation, 1).unwrap();
        state.transition(Running, 0).unwrap();
        assert_eq!(state.run_started_at, started);

        state.transition(Finished, 0).unwrap();
        assert!(state.run_started_at.is_none());
        assert!(state.elapsed().is_none());
    }

    #[test]
    fn test_reset_keeps_policy() {
        let mut state = SessionExecutionState::new(ConfirmationPolicy::AutoApproveAll);
        state.transition(Running, 0).unwrap();
        state.metrics.steps = 4;

        state.reset_transient();
        assert_eq!(state.status, Idle);
        assert_eq!(state.metrics, MetricsSnapshot::default());
        assert!(state.run_started_at.is_none());
        assert_eq!(state.policy, ConfirmationPolicy::AutoApproveAll);
    }

    #[test]
    fn test_force_settle_only_touches_active_sessions() {
        let mut state = SessionExecutionState::default();
        assert!(!state.force_settle());
        assert_eq!(state.status, Idle);

        state.transition(Running, 0).unwrap();
        state.transition(WaitingForConfirmation, 3).unwrap();
        assert!(state.force_settle());
        assert_eq!(state.status, Paused);
        assert_eq!(state.pending_action_count, 0);
    }
}
