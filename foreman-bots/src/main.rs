//! foreman: run a roster of LLM agents through the delivery workflow.
//!
//!   foreman run [--problem FILE]   Autonomous workflow, prints a report
//!   foreman interactive            `@TechLead ...` commands on stdin
//!   foreman agents                 List the roster
//!   foreman spawn <spec.json>      Create a dynamic agent
//!
//! Requires ANTHROPIC_API_KEY for `run` and `interactive`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman_bots::config::{Settings, load_agent_configs};
use foreman_bots::factory::Orchestrator;
use foreman_bots::llm::LlmClient;
use foreman_bots::spawner::{AgentSpec, Spawner};

#[derive(Parser)]
#[command(name = "foreman", about = "Multi-agent delivery orchestrator")]
struct Args {
    /// Project directory (agents/, roles/, workspace/ live here)
    #[arg(long, env = "FOREMAN_PROJECT_DIR", default_value = ".", global = true)]
    project_dir: PathBuf,

    /// Settings file (default: <project-dir>/foreman.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model for agents whose record does not name one
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autonomous delivery workflow
    Run {
        /// Problem statement file
        #[arg(long)]
        problem: Option<PathBuf>,
    },
    /// Talk to the lead agent with @mentions
    Interactive,
    /// List the agent roster
    Agents,
    /// Create a dynamic agent from a JSON specification
    Spawn {
        /// Path to the specification
        spec: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(&args.project_dir, args.config.as_deref())?;
    if let Some(model) = &args.model {
        settings.llm.default_model = model.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "foreman_bots={level},foreman_sdk={level}",
                    level = settings.log_level
                )
                .into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run { problem } => {
            let orchestrator = orchestrator(settings)?;
            let problem = problem.unwrap_or_else(|| orchestrator.settings().problem_file());
            orchestrator.start();
            let report = orchestrator.execute_workflow(&problem).await;
            orchestrator.shutdown().await;
            print!("{}", report.summary());
            if report.passed() {
                println!("✅ Workflow completed");
            } else {
                println!("⚠️  Workflow completed with failing tests");
            }
        }
        Command::Interactive => {
            let orchestrator = orchestrator(settings)?;
            orchestrator.start();
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let result = orchestrator.interactive(stdin, tokio::io::stdout()).await;
            orchestrator.shutdown().await;
            result?;
        }
        Command::Agents => {
            let configs = load_agent_configs(&settings)?;
            if configs.is_empty() {
                println!("No agents in {}", settings.agents_dir().display());
            }
            for config in configs {
                let can_invoke = if config.can_invoke.is_empty() {
                    "-".to_string()
                } else {
                    config.can_invoke.join(", ")
                };
                println!(
                    "{} {:<16} model={} invokes=[{}]{}",
                    config.emoji,
                    config.name,
                    config.model,
                    can_invoke,
                    if config.parallel_safe { " parallel" } else { "" }
                );
            }
        }
        Command::Spawn { spec } => {
            let raw = std::fs::read_to_string(&spec)
                .with_context(|| format!("Failed to read {}", spec.display()))?;
            let spec = AgentSpec::from_json(&raw)?;
            let spawned = Spawner::from_settings(&settings).spawn(&spec)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "agent_id": spawned.id,
                    "definition_path": spawned.config.role_file,
                    "expires": spawned.expires,
                    "status": "created",
                }))?
            );
        }
    }

    Ok(())
}

fn orchestrator(settings: Settings) -> Result<Orchestrator> {
    let api_key = settings
        .llm
        .api_key
        .clone()
        .context("ANTHROPIC_API_KEY is not set")?;
    let llm = Arc::new(LlmClient::from_settings(api_key, &settings.llm));
    Orchestrator::new(settings, llm)
}
