//! Console input: line parsing and interactive choices
//!
//! Stdin belongs to a dedicated thread. Interactive pickers run on that
//! thread too, so a picker never competes with the line reader.

use std::io::BufRead;

use conductor_core::{ConfirmationPolicy, Decision, DecisionKind, RiskLevel};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use tokio::sync::mpsc;
use tracing::warn;

/// One thing the user asked for
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Message(String),
    Pause,
    Cancel,
    Resume,
    Switch(String),
    ConfirmSwitch(bool),
    New,
    Policy(ConfirmationPolicy),
    /// Pick a policy interactively
    ChoosePolicy,
    Decide(Decision),
    /// Pick a decision interactively
    ChooseDecision,
    Condense,
    Status,
    Sessions,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  <text>              send a message to the current session
  /pause              pause the current session
  /cancel             cancel the current turn
  /resume             resume a paused session
  /switch <id>        switch to another session
  /confirm yes|no     answer a pending switch confirmation
  /new                start a new session
  /policy [policy]    change the confirmation policy (picker without one)
  /decide             answer the oldest pending confirmation
  /approve /reject [reason] /defer /always /risky
                      answer it directly
  /condense           condense the current session
  /status             show the current session state
  /sessions           list sessions
  /quit               exit";

/// Parse one input line; `Ok(None)` for a blank line
pub fn parse_line(line: &str) -> Result<Option<UserCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(UserCommand::Message(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "pause" => UserCommand::Pause,
        "cancel" => UserCommand::Cancel,
        "resume" => UserCommand::Resume,
        "switch" if arg.is_empty() => return Err("usage: /switch <id>".to_string()),
        "switch" => UserCommand::Switch(arg.to_string()),
        "confirm" => match arg {
            "yes" | "y" => UserCommand::ConfirmSwitch(true),
            "no" | "n" => UserCommand::ConfirmSwitch(false),
            _ => return Err("usage: /confirm yes|no".to_string()),
        },
        "new" => UserCommand::New,
        "policy" if arg.is_empty() => UserCommand::ChoosePolicy,
        "policy" => UserCommand::Policy(arg.parse::<ConfirmationPolicy>()?),
        "decide" => UserCommand::ChooseDecision,
        "approve" | "accept" => UserCommand::Decide(Decision::accept()),
        "reject" if arg.is_empty() => UserCommand::Decide(Decision::reject()),
        "reject" => UserCommand::Decide(Decision::reject_with(arg)),
        "defer" => UserCommand::Decide(Decision::defer()),
        "always" => UserCommand::Decide(Decision::always_proceed()),
        "risky" => UserCommand::Decide(Decision::confirm_risky()),
        "condense" => UserCommand::Condense,
        "status" => UserCommand::Status,
        "sessions" => UserCommand::Sessions,
        "help" | "?" => UserCommand::Help,
        "quit" | "exit" | "q" => UserCommand::Quit,
        other => return Err(format!("unknown command: /{}", other)),
    };
    Ok(Some(command))
}

const DECISION_CHOICES: &[(&str, DecisionKind)] = &[
    ("Accept", DecisionKind::Accept),
    ("Reject", DecisionKind::Reject),
    ("Defer (pause, decide later)", DecisionKind::Defer),
    ("Always proceed (stop asking)", DecisionKind::AlwaysProceed),
    ("Accept, then only ask for high-risk actions", DecisionKind::ConfirmRisky),
];

fn choose_decision() -> anyhow::Result<Decision> {
    let labels: Vec<&str> = DECISION_CHOICES.iter().map(|(label, _)| *label).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How should the pending actions proceed?")
        .items(&labels)
        .default(0)
        .interact()?;

    let decision = match DECISION_CHOICES[selection].1 {
        DecisionKind::Accept => Decision::accept(),
        DecisionKind::Reject => {
            let reason: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Reason (optional)")
                .allow_empty(true)
                .interact_text()?;
            if reason.trim().is_empty() {
                Decision::reject()
            } else {
                Decision::reject_with(reason.trim())
            }
        }
        DecisionKind::Defer => Decision::defer(),
        DecisionKind::AlwaysProceed => Decision::always_proceed(),
        DecisionKind::ConfirmRisky => Decision::confirm_risky(),
    };
    Ok(decision)
}

fn choose_policy() -> anyhow::Result<ConfirmationPolicy> {
    let choices = [
        ConfirmationPolicy::ConfirmAll,
        ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::Medium),
        ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::High),
        ConfirmationPolicy::AutoApproveAll,
    ];
    let labels: Vec<String> = choices
        .iter()
        .map(|policy| {
            let hint = match policy {
                ConfirmationPolicy::ConfirmAll => "ask before every action",
                ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::High) => "ask for high-risk actions",
                ConfirmationPolicy::ConfirmAboveThreshold(_) => "ask for medium and high-risk actions",
                ConfirmationPolicy::AutoApproveAll => "never ask",
            };
            format!("{:<22} {}", policy.to_string(), style(hint).dim())
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Confirmation policy")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(choices[selection])
}

/// Resolve interactive commands on the input thread
fn resolve(command: UserCommand) -> anyhow::Result<UserCommand> {
    Ok(match command {
        UserCommand::ChooseDecision => UserCommand::Decide(choose_decision()?),
        UserCommand::ChoosePolicy => UserCommand::Policy(choose_policy()?),
        other => other,
    })
}

/// Read stdin on its own thread, forwarding parsed commands
///
/// End of input is reported as [`UserCommand::Quit`].
pub fn spawn_reader(commands: mpsc::Sender<UserCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => {
                    let _ = commands.blocking_send(UserCommand::Quit);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    let _ = commands.blocking_send(UserCommand::Quit);
                    return;
                }
            }

            let command = match parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    eprintln!("{}", style(message).yellow());
                    continue;
                }
            };
            let command = match resolve(command) {
                Ok(command) => command,
                Err(e) => {
                    eprintln!("{}", style(format!("Selection aborted: {}", e)).yellow());
                    continue;
                }
            };

            let quit = command == UserCommand::Quit;
            if commands.blocking_send(command).is_err() || quit {
                return;
            }
        }
    });
}
