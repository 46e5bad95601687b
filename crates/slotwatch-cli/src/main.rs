use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use slotwatch_adapters::{load_target_seed, RemoteRanker, SimulatedRanker, SimulatedSource, SimulationProfile};
use slotwatch_agent::{AgentConfig, ConfirmationOutcome, MonitoringAgent, Prioritizer};
use slotwatch_core::{TargetId, TargetStatus};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "slotwatch")]
#[command(about = "Appointment slot monitoring and booking agent")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start monitoring and keep cycling until interrupted.
    Run,
    /// Run a single availability check over running targets.
    Once,
    /// Show which running target would be checked first.
    Rank,
    /// List targets and the schedule.
    Status,
    /// Change the status of one target (`--id`) or of all of them (`--all`).
    #[command(group(ArgGroup::new("scope").required(true).args(["id", "all"])))]
    SetStatus {
        status: TargetStatus,
        #[arg(long)]
        id: Option<TargetId>,
        #[arg(long)]
        all: bool,
    },
    /// Submit the confirmation code for a held slot.
    Confirm { id: TargetId, code: String },
    /// Give up a held slot and return the target to monitoring.
    CancelConfirm { id: TargetId },
    /// Add targets from a JSON seed file.
    Import { path: PathBuf },
    /// Send reminders for bookings due soon.
    Remind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AgentConfig::load()?;
    let source = Arc::new(SimulatedSource::new(
        SimulationProfile::default(),
        config.booking.api_token.clone(),
    ));
    let ranker: Arc<dyn RemoteRanker> = Arc::new(SimulatedRanker::default());
    let agent = MonitoringAgent::from_config(&config, source, Some(ranker.clone())).await?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Run => run(&agent, &config).await?,
        Commands::Once => {
            let report = agent.run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Rank => {
            let decision = Prioritizer::with_remote(ranker)
                .choose(agent.run_config().agent_model, &agent.targets(), Utc::now())
                .await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Status => print_status(&agent),
        Commands::SetStatus { status, id, .. } => match id {
            Some(id) => {
                let now = agent.set_target_status(id, status).await?;
                println!("{id}: {now}");
            }
            None => {
                agent.set_all_status(status).await?;
                println!("all targets: {status}");
            }
        },
        Commands::Confirm { id, code } => match agent.submit_confirmation(id, &code).await? {
            ConfirmationOutcome::Confirmed { confirmation_id } => {
                println!("booked: {}", confirmation_id.as_deref().unwrap_or("n/a"));
            }
            ConfirmationOutcome::Rejected { error } => {
                println!("booking failed, target back in monitoring: {error}");
            }
        },
        Commands::CancelConfirm { id } => {
            agent.cancel_confirmation(id).await?;
            println!("{id}: confirmation cancelled");
        }
        Commands::Import { path } => {
            let targets = load_target_seed(&path)?;
            let count = targets.len();
            for target in targets {
                agent.add_target(target).await?;
            }
            println!("imported {count} targets from {}", path.display());
        }
        Commands::Remind => {
            let sent = agent.send_due_reminders(Utc::now().date_naive()).await;
            println!("reminders sent: {}", sent.len());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,slotwatch=info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

async fn run(agent: &MonitoringAgent, config: &AgentConfig) -> Result<()> {
    let reminders = if config.reminder_enabled {
        let sched = agent.build_reminder_scheduler(&config.reminder_cron).await?;
        sched.start().await.context("starting reminder scheduler")?;
        Some(sched)
    } else {
        None
    };

    if !config.booking.enabled {
        info!("booking disabled; found slots are recorded without booking");
    }
    agent.start().await;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received, stopping");
    agent.stop().await;

    if let Some(mut sched) = reminders {
        sched.shutdown().await.context("stopping reminder scheduler")?;
    }
    Ok(())
}

fn print_status(agent: &MonitoringAgent) {
    let run = agent.run_config();
    println!(
        "global={} model={} interval={}s jitter={}s next_in={}",
        run.global_status,
        run.agent_model,
        run.poll_interval_seconds,
        run.poll_jitter_seconds,
        agent
            .seconds_until_next_run(Utc::now())
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string())
    );
    for target in agent.targets() {
        let date = target
            .found_date
            .or(target.pending_date)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<22} {:<12} {:<10} {:<10} {}",
            target.id, target.status.as_str(), target.display_name, target.portal, target.city, date
        );
    }
}
