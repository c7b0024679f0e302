//! CLI binary for the drover orchestration daemon.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use drover_agent::{Agent, CliAgent, ScriptedAgent};
use drover_pipeline::{DroverEvent, EventEmitter, Scheduler};
use drover_tracker::{GithubTracker, MemoryTracker, Tracker};
use drover_types::{DroverConfig, TicketId};

#[derive(Parser)]
#[command(name = "drover", version, about = "Label-driven ticket orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling scheduler until interrupted
    Run {
        /// Use an empty in-memory tracker and a scripted agent; nothing
        /// leaves the process
        #[arg(long)]
        dry_run: bool,
    },

    /// Drive one ticket through exactly one stage, then exit
    Step {
        /// Ticket reference, e.g. acme/api#42
        ticket: String,
    },

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { dry_run } => cmd_run(dry_run).await?,
        Commands::Step { ticket } => cmd_step(&ticket).await?,
        Commands::Config => cmd_config(),
    }

    Ok(())
}

fn collaborators(
    config: &DroverConfig,
    dry_run: bool,
) -> anyhow::Result<(Arc<dyn Tracker>, Arc<dyn Agent>)> {
    if dry_run {
        Ok((Arc::new(MemoryTracker::new()), Arc::new(ScriptedAgent::new())))
    } else {
        let tracker = GithubTracker::from_env()?;
        let agent = CliAgent::new(config.call_timeout());
        Ok((Arc::new(tracker), Arc::new(agent)))
    }
}

async fn cmd_run(dry_run: bool) -> anyhow::Result<()> {
    let mut config = DroverConfig::from_env();
    if dry_run {
        config.clone_workspaces = false;
    }
    info!(
        org = %config.org,
        entry_label = %config.entry_label,
        max_concurrent = config.max_concurrent,
        poll_interval_secs = config.poll_interval_secs,
        dry_run,
        "starting scheduler"
    );

    let (tracker, agent) = collaborators(&config, dry_run)?;
    let events = EventEmitter::default();
    tokio::spawn(report_events(events.subscribe()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(tracker, agent, config, events);
    scheduler.run(shutdown_rx).await?;
    info!("scheduler stopped");
    Ok(())
}

async fn cmd_step(ticket: &str) -> anyhow::Result<()> {
    let id = TicketId::parse(ticket)
        .ok_or_else(|| anyhow::anyhow!("invalid ticket reference '{ticket}', expected owner/repo#N"))?;
    let config = DroverConfig::from_env();
    let (tracker, agent) = collaborators(&config, false)?;

    let outcome = drover_pipeline::step_ticket(tracker, agent, config, &id).await?;
    println!("{}: {:?}", id, outcome.kind);
    if !outcome.notes.is_empty() {
        println!("  {}", outcome.notes);
    }
    Ok(())
}

fn cmd_config() {
    let config = DroverConfig::from_env();
    match toml::to_string_pretty(&config) {
        Ok(rendered) => print!("{rendered}"),
        Err(err) => warn!(error = %err, "could not render config"),
    }
}

async fn report_events(mut rx: tokio::sync::broadcast::Receiver<DroverEvent>) {
    loop {
        match rx.recv().await {
            Ok(DroverEvent::CycleStarted { actionable, in_flight }) => {
                info!(actionable, in_flight, "poll cycle");
            }
            Ok(DroverEvent::TicketDispatched { ticket, stage }) => {
                info!(%ticket, %stage, "dispatched");
            }
            Ok(DroverEvent::StageCompleted { ticket, stage, outcome }) => {
                info!(%ticket, %stage, %outcome, "stage completed");
            }
            Ok(DroverEvent::TicketRetried { ticket, stage, retry_number }) => {
                info!(%ticket, %stage, retry_number, "retrying");
            }
            Ok(DroverEvent::TicketEscalated { ticket, stage, reason }) => {
                warn!(%ticket, %stage, %reason, "escalated to human");
            }
            Ok(DroverEvent::TicketCompleted { ticket }) => {
                info!(%ticket, "completed");
            }
            Ok(DroverEvent::RateLimitBackoff { streak, delay_secs }) => {
                warn!(streak, delay_secs, "rate limited, backing off");
            }
            Ok(DroverEvent::CooldownEntered { cooldown_secs }) => {
                info!(cooldown_secs, "rate limit cleared, cooling down");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event reporter lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
