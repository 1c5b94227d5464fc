//! Channel-backed confirmation prompt
//!
//! Front ends that cannot implement [`ConfirmationPrompt`] directly (an event
//! loop owning the terminal, a UI thread) receive [`DecisionRequest`]s on a
//! channel and answer each through its oneshot responder.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{ConfirmationPrompt, Decision};
use crate::engine::PendingAction;
use crate::error::{Error, Result};
use crate::session::SessionId;

/// A pending escalation waiting for a decision
#[derive(Debug)]
pub struct DecisionRequest {
    pub session_id: SessionId,
    pub actions: Vec<PendingAction>,
    pub response_tx: oneshot::Sender<Decision>,
}

impl DecisionRequest {
    /// Answer the request; false if the asking worker is gone
    pub fn respond(self, decision: Decision) -> bool {
        self.response_tx.send(decision).is_ok()
    }
}

/// Receiver half handed to the front end
pub type DecisionRequestReceiver = mpsc::Receiver<DecisionRequest>;

/// [`ConfirmationPrompt`] forwarding every request over a channel
#[derive(Clone)]
pub struct ChannelPrompt {
    request_tx: mpsc::Sender<DecisionRequest>,
}

/// Create a prompt and the receiver its requests arrive on
pub fn decision_channel(buffer: usize) -> (ChannelPrompt, DecisionRequestReceiver) {
    let (request_tx, request_rx) = mpsc::channel(buffer);
    (ChannelPrompt { request_tx }, request_rx)
}

#[async_trait]
impl ConfirmationPrompt for ChannelPrompt {
    async fn request_decision(&self, session_id: &SessionId, actions: Vec<PendingAction>) -> Result<Decision> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(DecisionRequest {
                session_id: session_id.clone(),
                actions,
                response_tx,
            })
            .await
            .map_err(|_| Error::Escalation("decision receiver closed".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Escalation("decision request dropped without an answer".to_string()))
    }
}
