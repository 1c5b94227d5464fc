//! Engine event log types
//!
//! The engine keeps an append-only log of what happened in a conversation.
//! The coordinator only reads it, mostly to find actions that still need a
//! decision.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::policy::RiskLevel;

/// An agent-proposed operation awaiting approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk: RiskLevel,
}

impl PendingAction {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            description: String::new(),
            risk,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One entry of the engine's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    UserMessage { content: String },
    AgentMessage { content: String },
    /// The agent proposed an action
    Action { action: PendingAction },
    /// The action ran and produced output
    Observation { tool_call_id: String, output: String },
    /// The user declined the action
    Rejection { tool_call_id: String, reason: String },
    /// History was condensed into a summary
    Condensation { summary: String },
}

/// What the agent produced in a conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Agent messages and proposed actions
    pub agent_event_count: usize,
    pub last_agent_message: Option<String>,
}

impl ConversationSummary {
    pub fn from_events(events: &[EngineEvent]) -> Self {
        let mut summary = Self::default();
        for event in events {
            match event {
                EngineEvent::AgentMessage { content } => {
                    summary.agent_event_count += 1;
                    summary.last_agent_message = Some(content.clone());
                }
                EngineEvent::Action { .. } => summary.agent_event_count += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Actions in the log that have neither an observation nor a rejection
///
/// Order follows the log.
pub fn unmatched_actions(events: &[EngineEvent]) -> Vec<PendingAction> {
    let resolved: HashSet<&str> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Observation { tool_call_id, .. } | EngineEvent::Rejection { tool_call_id, .. } => {
                Some(tool_call_id.as_str())
            }
            _ => None,
        })
        .collect();

    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Action { action } if !resolved.contains(action.tool_call_id.as_str()) => {
                Some(action.clone())
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, risk: RiskLevel) -> EngineEvent {
        EngineEvent::Action {
            action: PendingAction::new(id, "shell", risk),
        }
    }

    #[test]
    fn test_unmatched_actions_skips_observed_and_rejected() {
        let events = vec![
            EngineEvent::UserMessage {
                content: "clean up".to_string(),
            },
            action("call-1", RiskLevel::Low),
            action("call-2", RiskLevel::High),
            action("call-3", RiskLevel::Medium),
            EngineEvent::Observation {
                tool_call_id: "call-1".to_string(),
                output: "ok".to_string(),
            },
            EngineEvent::Rejection {
                tool_call_id: "call-3".to_string(),
                reason: "no".to_string(),
            },
        ];

        let pending = unmatched_actions(&events);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_call_id, "call-2");
        assert_eq!(pending[0].risk, RiskLevel::High);
    }

    #[test]
    fn test_unmatched_actions_empty_log() {
        assert!(unmatched_actions(&[]).is_empty());
    }

    #[test]
    fn test_summary_counts_agent_events() {
        let events = vec![
            EngineEvent::UserMessage {
                content: "clean up".to_string(),
            },
            action("call-1", RiskLevel::Low),
            EngineEvent::Observation {
                tool_call_id: "call-1".to_string(),
                output: "ok".to_string(),
            },
            EngineEvent::AgentMessage {
                content: "first".to_string(),
            },
            EngineEvent::AgentMessage {
                content: "Build directory removed.".to_string(),
            },
        ];

        let summary = ConversationSummary::from_events(&events);
        assert_eq!(summary.agent_event_count, 3);
        assert_eq!(summary.last_agent_message.as_deref(), Some("Build directory removed."));
        assert_eq!(ConversationSummary::from_events(&[]), ConversationSummary::default());
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&action("call-9", RiskLevel::Medium)).unwrap();
        assert!(json.contains("\"type\":\"action\""));
        assert!(json.contains("call-9"));
    }
}
