//! foreman-stop-gate: decide whether an autonomous session may stop.
//!
//! Invoked as a stop hook with a JSON record on stdin. When tests are not
//! green and attempts remain, prints the next-step guidance to stderr and
//! exits 2 so the session keeps going. Otherwise prints "Stop OK" and
//! exits 0.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use foreman_bots::config::Settings;
use foreman_sdk::{AttemptGate, GateDecision};

#[derive(Parser)]
#[command(name = "foreman-stop-gate", about = "Bounded stop gate for autonomous runs")]
struct Args {
    /// Project directory
    #[arg(long, env = "FOREMAN_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// Settings file (default: <project-dir>/foreman.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// The hook record. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct HookInput {
    #[serde(default)]
    stop_hook_active: bool,
}

fn main() -> ExitCode {
    // stderr is read by the session when we block; keep logs quiet.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman_sdk=warn,foreman_bots=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            // A broken gate must never trap the session in a loop.
            tracing::error!(error = format_args!("{e:#}"), "Stop gate failed, allowing stop");
            println!("Stop OK");
            ExitCode::SUCCESS
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();
    let settings = Settings::load(&args.project_dir, args.config.as_deref())?;

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("Failed to read hook input")?;
    let input: HookInput = if raw.trim().is_empty() {
        HookInput::default()
    } else {
        serde_json::from_str(&raw).context("Invalid hook input")?
    };

    let gate = AttemptGate::new(settings.gate_state_file(), settings.verdict_file())
        .with_max_attempts(settings.gate.max_attempts)
        .with_lock_timeout(Duration::from_millis(settings.gate.lock_timeout_ms));

    match gate.consult(input.stop_hook_active)? {
        GateDecision::Continue { guidance, .. } => {
            eprintln!("{guidance}");
            Ok(ExitCode::from(2))
        }
        GateDecision::StopPassed | GateDecision::StopExhausted { .. } => {
            println!("Stop OK");
            Ok(ExitCode::SUCCESS)
        }
    }
}
