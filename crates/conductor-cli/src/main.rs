//! Conductor CLI - console control surface for the execution coordinator
//!
//! Drives the coordinator against the scripted engine: messages start turns,
//! slash commands pause, cancel, switch and change the confirmation policy,
//! and pending actions are confirmed from the console. With `--headless` it
//! runs a single task with every action auto-approved and prints a summary.

mod input;
mod render;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use console::style;
use tokio::sync::mpsc;
use tracing::debug;

use conductor_core::approval::DecisionRequestReceiver;
use conductor_core::{
    CancelOutcome, ConfigManager, ConfirmationPolicy, Coordinator, CoordinatorSettings, DecisionRequest,
    EventReceiver, ExecutionStatus, PauseOutcome, PendingAction, RiskLevel, Script, ScriptStep, ScriptedFactory,
    SessionEvent, StepUsage, SubmitOutcome, SwitchOutcome, decision_channel,
};
use input::UserCommand;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and steer multiple agent conversations from the console", long_about = None)]
struct Cli {
    /// Engine script (TOML or JSON) played by every session
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Confirmation policy (confirm_all, auto_approve_all, confirm_above:<risk>)
    #[arg(short, long)]
    policy: Option<ConfirmationPolicy>,

    /// Auto-approve all pending actions (use with caution!)
    #[arg(long)]
    auto_approve: bool,

    /// Session to start in (a new one by default)
    #[arg(long)]
    session: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one task without the console, auto-approving every action
    #[arg(long, requires = "task")]
    headless: bool,

    /// Task to run in headless mode
    #[arg(short, long)]
    task: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Script used when none is given: two confirmations, then a reply
fn demo_script() -> Script {
    Script::new(vec![
        ScriptStep::stall(800),
        ScriptStep::confirm(vec![
            PendingAction::new("read-1", "read_file", RiskLevel::Low).with_description("Read Cargo.toml"),
        ]),
        ScriptStep::stall(800),
        ScriptStep::confirm(vec![
            PendingAction::new("shell-1", "execute_command", RiskLevel::High).with_description("cargo publish"),
            PendingAction::new("write-1", "write_file", RiskLevel::Medium).with_description("Update CHANGELOG.md"),
        ]),
        ScriptStep::finish("All requested changes are in place."),
    ])
    .repeating()
    .with_usage(StepUsage {
        prompt_tokens: 1200,
        completion_tokens: 300,
        cost: 0.0045,
    })
}

fn load_settings(cli: &Cli) -> anyhow::Result<(ConfigManager, CoordinatorSettings)> {
    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let mut settings = config_manager.settings()?;

    // CLI flags take precedence over the config file
    if let Some(policy) = cli.policy {
        settings = settings.with_policy(policy);
    }
    // Nobody is there to answer in headless mode
    if cli.auto_approve || cli.headless {
        settings = settings.with_policy(ConfirmationPolicy::AutoApproveAll);
    }
    Ok((config_manager, settings))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config_manager, settings) = load_settings(&cli)?;

    // Keep logs quiet by default so they do not interleave with the console
    let filter = if cli.verbose {
        "info,conductor_core=debug".to_string()
    } else {
        config_manager.config().general.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
    debug!(config = %config_manager.config_path().display(), ?settings, "Starting");

    let script = match &cli.script {
        Some(path) => Script::load(path)?,
        None => demo_script(),
    };
    let factory = Arc::new(ScriptedFactory::new(script));
    let (prompt, requests) = decision_channel(16);
    let (coordinator, events) = Coordinator::new(factory, Arc::new(prompt), settings.clone());

    let current = match &cli.session {
        Some(session_id) => {
            coordinator.request_switch(session_id).await?;
            session_id.clone()
        }
        None => coordinator.create_session().await?,
    };

    if cli.headless {
        let Some(task) = cli.task.as_deref() else {
            anyhow::bail!("--headless needs a --task");
        };
        let result = run_headless(&coordinator, events, &current, task).await;
        coordinator.shutdown(settings.cancel_timeout).await?;
        return result;
    }

    println!("{}", style("Conductor").bold().cyan());
    println!(
        "  Session: {}   Policy: {}",
        style(&current).green(),
        style(settings.policy).yellow()
    );
    println!("  {}", style("Type a message, or /help for commands").dim());
    println!();

    let (commands_tx, commands_rx) = mpsc::channel(16);
    input::spawn_reader(commands_tx);

    let mut console = Console {
        coordinator: coordinator.clone(),
        current: Some(current),
        decisions: VecDeque::new(),
    };
    let result = console.run(commands_rx, events, requests).await;

    coordinator.shutdown(settings.cancel_timeout).await?;
    result
}

/// Run `task` to the end of its turn and print what the agent produced
async fn run_headless(
    coordinator: &Coordinator,
    mut events: EventReceiver,
    session_id: &str,
    task: &str,
) -> anyhow::Result<()> {
    println!("Agent is working");
    coordinator.submit_message(session_id, task).await?;

    let mut status = None;
    while let Some((id, event)) = events.recv().await {
        if id != session_id {
            continue;
        }
        match &event {
            SessionEvent::TurnFinished { status: settled } => {
                status = Some(*settled);
                break;
            }
            SessionEvent::Notification { .. } => render::event(&id, &event, Some(session_id)),
            _ => {}
        }
    }
    println!("Agent finished");

    let summary = coordinator.summary(session_id).await?;
    render::summary(&summary);
    match status {
        Some(ExecutionStatus::Finished) => Ok(()),
        Some(status) => anyhow::bail!("Turn ended {}", status),
        None => anyhow::bail!("Coordinator stopped before the turn ended"),
    }
}

/// Console session state
struct Console {
    coordinator: Coordinator,
    /// Mirror of the coordinator's current session, for labelling output
    current: Option<String>,
    /// Escalations waiting for the user, oldest first
    decisions: VecDeque<DecisionRequest>,
}

impl Console {
    async fn run(
        &mut self,
        mut commands: mpsc::Receiver<UserCommand>,
        mut events: EventReceiver,
        mut requests: DecisionRequestReceiver,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if !self.handle(command).await? {
                        return Ok(());
                    }
                }
                Some(request) = requests.recv() => {
                    self.decisions.push_back(request);
                    if let Some(oldest) = self.decisions.front() {
                        render::decision_request(oldest, self.decisions.len());
                    }
                }
                Some((session_id, event)) = events.recv() => {
                    render::event(&session_id, &event, self.current.as_deref());
                }
                else => return Ok(()),
            }
        }
    }

    fn current(&self) -> anyhow::Result<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no active session; use /new or /switch <id>"))
    }

    /// Handle one command; false to quit
    async fn handle(&mut self, command: UserCommand) -> anyhow::Result<bool> {
        match self.dispatch(command).await {
            Ok(keep_going) => Ok(keep_going),
            // Coordinator errors are reported, not fatal
            Err(e) => {
                render::error(e);
                Ok(true)
            }
        }
    }

    async fn dispatch(&mut self, command: UserCommand) -> anyhow::Result<bool> {
        match command {
            UserCommand::Message(text) => match self.coordinator.submit_to_current(&text).await? {
                SubmitOutcome::Started => {}
                SubmitOutcome::Queued => {
                    println!("{}", style("Queued for the running turn").dim());
                }
            },
            UserCommand::Pause => {
                let session_id = self.current()?.to_string();
                if self.coordinator.request_pause(&session_id).await? == PauseOutcome::NothingToPause {
                    debug!(session_id = %session_id, "Nothing to pause");
                }
            }
            UserCommand::Cancel => {
                let session_id = self.current()?.to_string();
                match self.coordinator.cancel(&session_id).await? {
                    CancelOutcome::NotRunning => println!("{}", style("Nothing is running").dim()),
                    CancelOutcome::Cooperative => println!("{}", style("Cancelled").green()),
                    CancelOutcome::Forced => {
                        println!("{}", style("Cancelled (the engine had to be stopped)").yellow())
                    }
                }
            }
            UserCommand::Resume => {
                let session_id = self.current()?.to_string();
                self.coordinator.resume(&session_id).await?;
            }
            UserCommand::Switch(target) => {
                let outcome = self.coordinator.request_switch(&target).await?;
                self.switched(outcome).await?;
            }
            UserCommand::ConfirmSwitch(confirmed) => {
                let outcome = self.coordinator.confirm_switch(confirmed).await?;
                self.switched(outcome).await?;
            }
            UserCommand::New => {
                let session_id = self.coordinator.create_session().await?;
                self.current = Some(session_id);
            }
            UserCommand::Policy(policy) => {
                self.coordinator.set_confirmation_policy(policy).await?;
                println!("{} {}", style("Policy:").dim(), style(policy).cyan());
            }
            UserCommand::Decide(decision) => match self.decisions.pop_front() {
                Some(request) => {
                    let session_id = request.session_id.clone();
                    if !request.respond(decision) {
                        println!(
                            "{}",
                            style(format!("Session {} stopped waiting for this decision", session_id)).dim()
                        );
                    }
                    if let Some(next) = self.decisions.front() {
                        render::decision_request(next, self.decisions.len());
                    }
                }
                None => println!("{}", style("Nothing is waiting for a decision").dim()),
            },
            UserCommand::Condense => {
                let session_id = self.current()?.to_string();
                self.coordinator.condense(&session_id).await?;
            }
            UserCommand::Status => {
                let session_id = self.current()?.to_string();
                let state = self.coordinator.state(&session_id).await?;
                render::state(&session_id, &state);
            }
            UserCommand::Sessions => {
                let ids = self.coordinator.sessions().await?;
                render::sessions(&ids, self.current.as_deref());
            }
            UserCommand::Help => println!("{}", input::HELP),
            UserCommand::Quit => return Ok(false),
            // Pickers are resolved on the input thread
            UserCommand::ChoosePolicy | UserCommand::ChooseDecision => {}
        }
        Ok(true)
    }

    async fn switched(&mut self, outcome: SwitchOutcome) -> anyhow::Result<()> {
        match outcome {
            SwitchOutcome::AlreadyActive | SwitchOutcome::AwaitingConfirmation => {}
            SwitchOutcome::Switched { .. } => {
                self.current = self.coordinator.current_session().await?;
            }
            SwitchOutcome::Cancelled => println!("{}", style("Switch cancelled").dim()),
        }
        Ok(())
    }
}
