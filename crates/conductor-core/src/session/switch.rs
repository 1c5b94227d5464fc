//! Session switching state machine
//!
//! Holds the active session pointer and the progress of a switch. It performs
//! no I/O; the control loop drives it and does the pausing and preparing.

use crate::error::{Error, Result};

use super::types::SessionId;

/// Progress of a switch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SwitchPhase {
    #[default]
    Idle,
    /// The current session is running; waiting for the user's go-ahead
    AwaitingConfirmation { target: SessionId },
    /// Pausing the outgoing session
    Pausing { target: SessionId },
    PreparingTarget { target: SessionId },
}

/// What to do after a switch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchStep {
    AlreadyActive,
    /// Ask the user before leaving the running session
    Confirm { target: SessionId },
    Prepare { target: SessionId },
}

/// What to do after the user answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStep {
    Cancelled { target: SessionId },
    /// Pause the outgoing session, then prepare `target`
    Pause { target: SessionId },
}

#[derive(Debug, Default)]
pub struct SwitchCoordinator {
    active: Option<SessionId>,
    phase: SwitchPhase,
    previous: Option<SessionId>,
}

impl SwitchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session control focus is on; `None` while a target is being prepared
    pub fn active(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn phase(&self) -> &SwitchPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SwitchPhase::Idle
    }

    pub fn request(&mut self, target: &str, current_running: bool) -> Result<SwitchStep> {
        if !self.is_idle() {
            return Err(Error::SwitchInProgress);
        }
        if self.active.as_deref() == Some(target) {
            return Ok(SwitchStep::AlreadyActive);
        }

        let target = target.to_string();
        if current_running && self.active.is_some() {
            self.phase = SwitchPhase::AwaitingConfirmation {
                target: target.clone(),
            };
            return Ok(SwitchStep::Confirm { target });
        }

        self.begin_prepare(target.clone());
        Ok(SwitchStep::Prepare { target })
    }

    pub fn confirm(&mut self, confirmed: bool) -> Result<ConfirmStep> {
        if !matches!(self.phase, SwitchPhase::AwaitingConfirmation { .. }) {
            return Err(Error::NoPendingSwitch);
        }
        let SwitchPhase::AwaitingConfirmation { target } = std::mem::take(&mut self.phase) else {
            return Err(Error::NoPendingSwitch);
        };

        if !confirmed {
            return Ok(ConfirmStep::Cancelled { target });
        }
        self.phase = SwitchPhase::Pausing {
            target: target.clone(),
        };
        Ok(ConfirmStep::Pause { target })
    }

    /// The outgoing session was paused (or the attempt is over)
    pub fn paused(&mut self) -> Result<SessionId> {
        match std::mem::take(&mut self.phase) {
            SwitchPhase::Pausing { target } => {
                self.begin_prepare(target.clone());
                Ok(target)
            }
            other => {
                self.phase = other;
                Err(Error::InvariantViolation(
                    "switch pause finished outside the pausing phase".to_string(),
                ))
            }
        }
    }

    /// Target is attached; returns the session switched away from
    pub fn complete(&mut self) -> Result<Option<SessionId>> {
        match std::mem::take(&mut self.phase) {
            SwitchPhase::PreparingTarget { target } => {
                self.active = Some(target);
                Ok(self.previous.take())
            }
            other => {
                self.phase = other;
                Err(Error::InvariantViolation(
                    "switch completed outside the preparing phase".to_string(),
                ))
            }
        }
    }

    /// Preparing the target failed; restore the previous session as active
    pub fn fail(&mut self) -> Option<SessionId> {
        self.phase = SwitchPhase::Idle;
        self.active = self.previous.take();
        self.active.clone()
    }

    /// Focus a freshly created session
    pub fn start_new(&mut self, session_id: SessionId) -> Result<Option<SessionId>> {
        if !self.is_idle() {
            return Err(Error::SwitchInProgress);
        }
        Ok(self.active.replace(session_id))
    }

    fn begin_prepare(&mut self, target: SessionId) {
        self.previous = self.active.take();
        self.phase = SwitchPhase::PreparingTarget { target };
    }
}
