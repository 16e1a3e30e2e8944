//! CLI entry point for agent-hive

mod demo;

use agent_hive_agent::TaskOutcome;
use agent_hive_core::config::{Config, ConfigLoader};
use agent_hive_core::logging::init_logging;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use demo::{report_pipeline, DemoTeam, ROLES};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "agent-hive")]
#[command(about = "Message-passing coordination for cooperating agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the research -> analysis -> writing pipeline with stub agents
    Demo {
        /// Report topic
        #[arg(short, long, default_value = "multi-agent systems")]
        topic: String,
        /// Per-subtask deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Make one role's collaborator fail
        #[arg(long, value_parser = ROLES)]
        fail: Option<String>,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Start the demo agents and report their status
    Agents,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader
        .load()
        .with_context(|| format!("loading {}", loader.config_path().display()))?;
    let _guard = init_logging(&config.logging);

    match cli.command {
        Commands::Demo {
            topic,
            timeout_ms,
            fail,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.coordinator.default_timeout());
            run_demo(&config, &topic, timeout, fail.as_deref()).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => run_config_show(&config)?,
            ConfigCommands::Init { force } => run_config_init(&loader, force)?,
        },
        Commands::Agents => run_agents(&config).await?,
    }

    Ok(())
}

async fn run_demo(config: &Config, topic: &str, timeout: Duration, fail: Option<&str>) -> Result<()> {
    println!("{}", style("Starting agent-hive demo...").bold().cyan());
    let team = DemoTeam::start(config, fail)?;

    info!("Dispatching report pipeline for '{}'", topic);
    let outcome = team
        .coordinator
        .decompose_and_dispatch(report_pipeline(topic, timeout))
        .await;
    team.stop().await;
    let outcome = outcome?;

    println!();
    println!("{}", style(format!("Composite task {}", outcome.task_id)).bold());
    for (subtask, result) in &outcome.outcomes {
        let status = match result {
            TaskOutcome::Completed(_) => style(result.status().to_string()).green(),
            TaskOutcome::Cancelled => style(result.status().to_string()).dim(),
            _ => style(result.status().to_string()).red(),
        };
        println!("  {:<10} {}", subtask, status);
        if let Some(error) = result.error() {
            println!("             {}", style(error).dim());
        }
    }

    if let Some(report) = outcome.get("write").and_then(TaskOutcome::payload) {
        println!();
        println!("{}", style("Report:").bold());
        println!("{}", report.as_str().map_or_else(|| report.to_string(), str::to_string));
    }

    if outcome.is_complete() {
        println!("\n{} all subtasks completed", style("✓").green().bold());
        Ok(())
    } else {
        bail!("unfinished subtasks: {}", outcome.unfinished().join(", "))
    }
}

fn run_config_show(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn run_config_init(loader: &ConfigLoader, force: bool) -> Result<()> {
    let path = loader.config_path();
    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            style("✗").red(),
            path.display()
        );
        return Ok(());
    }
    loader.save(&Config::default())?;
    println!("{} Wrote {}", style("✓").green().bold(), path.display());
    Ok(())
}

async fn run_agents(config: &Config) -> Result<()> {
    let team = DemoTeam::start(config, None)?;

    println!("{}", style("Registered agents").bold().cyan());
    for agent in team.bus.list_agents() {
        println!(
            "  {:<16} {:<8} pending={} capabilities={}",
            style(&agent.agent_id).bold(),
            agent.state,
            agent.pending,
            agent.capabilities.join(",")
        );
    }

    println!();
    println!("{}", style("Status sweep").bold().cyan());
    let statuses = team.coordinator.gather_agent_status(None).await;
    for (agent_id, status) in &statuses {
        println!(
            "  {:<16} {:<8} processed={} failed={} workload={:.1}",
            agent_id, status.state, status.processed, status.failed, status.workload
        );
    }
    let silent = team
        .bus
        .registered_agents()
        .len()
        .saturating_sub(statuses.len() + 1);
    if silent > 0 {
        println!("  {} {} agent(s) did not answer", style("!").yellow(), silent);
    }

    team.stop().await;
    Ok(())
}
