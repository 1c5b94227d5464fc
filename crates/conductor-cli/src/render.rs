//! Printing coordinator output to the console

use conductor_core::{
    ConversationSummary, DecisionRequest, ExecutionStatus, PendingAction, RiskLevel, SessionEvent,
    SessionExecutionState, Severity,
};
use console::style;

fn short(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

fn status_label(status: ExecutionStatus) -> console::StyledObject<String> {
    let label = status.to_string();
    match status {
        ExecutionStatus::Running => style(label).cyan(),
        ExecutionStatus::WaitingForConfirmation => style(label).yellow().bold(),
        ExecutionStatus::Paused => style(label).yellow(),
        ExecutionStatus::Finished => style(label).green(),
        ExecutionStatus::Idle => style(label).dim(),
    }
}

fn risk_label(risk: RiskLevel) -> console::StyledObject<String> {
    let label = risk.to_string();
    match risk {
        RiskLevel::Low => style(label).green(),
        RiskLevel::Medium => style(label).yellow(),
        RiskLevel::High => style(label).red().bold(),
    }
}

fn print_actions(actions: &[PendingAction]) {
    for action in actions {
        println!(
            "  {} {} [{}] {}",
            style("•").cyan(),
            style(&action.tool_name).bold(),
            risk_label(action.risk),
            style(&action.description).dim()
        );
    }
}

/// Print one session event
///
/// Events from sessions other than `current` are prefixed with their id.
pub fn event(session_id: &str, event: &SessionEvent, current: Option<&str>) {
    let prefix = if current == Some(session_id) {
        String::new()
    } else {
        format!("{} ", style(format!("[{}]", short(session_id))).dim())
    };

    match event {
        SessionEvent::Created => {
            println!("{}{}", prefix, style("Session created").dim());
        }
        SessionEvent::Switched { .. } => {}
        SessionEvent::StatusChanged { status, .. } => {
            println!("{}{} {}", prefix, style("Status:").dim(), status_label(*status));
        }
        // The decision request that follows lists the actions
        SessionEvent::ConfirmationRequired { actions } => {
            println!(
                "{}{}",
                prefix,
                style(format!("Waiting for confirmation of {} action(s)", actions.len())).yellow()
            );
        }
        SessionEvent::MetricsUpdated { metrics } => {
            println!(
                "{}{}",
                prefix,
                style(format!(
                    "steps {} · tokens {} · cost ${:.4}",
                    metrics.steps,
                    metrics.total_tokens(),
                    metrics.accumulated_cost
                ))
                .dim()
            );
        }
        SessionEvent::PolicyChanged { policy } => {
            println!("{}{} {}", prefix, style("Policy:").dim(), style(policy).cyan());
        }
        SessionEvent::SwitchConfirmationRequired { target } => {
            println!(
                "{}{}",
                prefix,
                style(format!(
                    "This conversation is running. Pause it and switch to {}? (/confirm yes|no)",
                    short(target)
                ))
                .yellow()
            );
        }
        SessionEvent::TurnFinished { status } => {
            println!("{}{} {}", prefix, style("Turn ended:").bold(), status_label(*status));
        }
        SessionEvent::Notification {
            title,
            message,
            severity,
        } => {
            let title = match severity {
                Severity::Information => style(title.as_str()).bold().green(),
                Severity::Warning => style(title.as_str()).bold().yellow(),
                Severity::Error => style(title.as_str()).bold().red(),
            };
            println!("{}{}: {}", prefix, title, message);
        }
    }
}

/// Announce a request waiting in the decision queue
pub fn decision_request(request: &DecisionRequest, queued: usize) {
    println!(
        "{} {}",
        style(format!("[{}]", short(&request.session_id))).dim(),
        style(format!("{} action(s) need a decision", request.actions.len())).yellow().bold()
    );
    print_actions(&request.actions);
    let hint = if queued > 1 {
        format!("/decide to answer ({} waiting)", queued)
    } else {
        "/decide to answer, or /approve /reject /defer /always /risky".to_string()
    };
    println!("  {}", style(hint).dim());
}

pub fn state(session_id: &str, state: &SessionExecutionState) {
    println!("{} {}", style("Session:").bold(), style(session_id).cyan());
    println!("  Status:   {}", status_label(state.status));
    println!("  Policy:   {}", state.policy);
    println!("  Pending:  {}", state.pending_action_count);
    if let Some(elapsed) = state.elapsed() {
        println!("  Running:  {:.1}s", elapsed.as_secs_f64());
    }
    println!(
        "  Usage:    {} steps, {} tokens, ${:.4}",
        state.metrics.steps,
        state.metrics.total_tokens(),
        state.metrics.accumulated_cost
    );
}

/// Headless run report
pub fn summary(summary: &ConversationSummary) {
    println!("{}", style("Conversation Summary").bold().cyan());
    println!("  Agent events: {}", summary.agent_event_count);
    match &summary.last_agent_message {
        Some(message) => println!("  Last agent message: {}", message),
        None => println!("  {}", style("No agent messages found").dim()),
    }
}

pub fn sessions(ids: &[String], current: Option<&str>) {
    if ids.is_empty() {
        println!("  {}", style("No sessions yet").dim());
        return;
    }
    for id in ids {
        if current == Some(id.as_str()) {
            println!("  {} {}", style("*").green(), style(id).bold());
        } else {
            println!("    {}", id);
        }
    }
}

pub fn error(error: impl std::fmt::Display) {
    println!("{}", style(format!("Error: {}", error)).red());
}
