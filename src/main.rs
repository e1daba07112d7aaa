//! Autonomous multi-agent engineering loop.
//!
//! Decomposes a goal into tasks with a planner agent, executes them with
//! parallel worker agents that commit per task, and lets a judge agent decide
//! when the goal is done. Session state lives under `.conductor/` and is
//! resumable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use conductor::agents::detect_available;
use conductor::agents::executor::SubprocessInvoker;
use conductor::core::session::SessionStatus;
use conductor::engine::orchestrator::{EngineResult, Orchestrator};
use conductor::io::config::{EngineConfig, ModelPreset, load_config};
use conductor::io::paths::StatePaths;
use conductor::io::store::{load_pool, load_session};
use conductor::{exit_codes as codes, logging};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Autonomous multi-agent software-engineering loop"
)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session for a goal and run it.
    Run {
        /// The natural-language goal to pursue.
        #[arg(long)]
        goal: String,
        /// Override the configured cycle budget.
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,
        /// Model preset applied across all agent kinds.
        #[arg(long, value_enum)]
        preset: Option<PresetArg>,
    },
    /// Resume the session recorded under `.conductor/`.
    Resume,
    /// Print session, task, and agent-pool state.
    Status,
    /// Probe for installed agent CLIs.
    Agents,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PresetArg {
    Fast,
    Default,
    Max,
}

impl From<PresetArg> for ModelPreset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Fast => ModelPreset::Fast,
            PresetArg::Default => ModelPreset::Default,
            PresetArg::Max => ModelPreset::Max,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = match cli.path {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let paths = StatePaths::new(&root);

    match cli.command {
        Command::Run {
            goal,
            max_cycles,
            workers,
            preset,
        } => {
            let mut config = load_config(&paths.config_path)?;
            if let Some(max_cycles) = max_cycles {
                config.max_cycles = max_cycles;
            }
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            if let Some(preset) = preset {
                config.apply_preset(preset.into());
            }
            config.validate()?;
            let result = build_orchestrator(&root, &paths, config)?.start(&goal)?;
            report(&result);
            Ok(status_code(result.status))
        }
        Command::Resume => {
            let config = load_config(&paths.config_path)?;
            let result = build_orchestrator(&root, &paths, config)?.resume()?;
            report(&result);
            Ok(status_code(result.status))
        }
        Command::Status => {
            cmd_status(&paths)?;
            Ok(codes::OK)
        }
        Command::Agents => {
            let available = detect_available();
            if available.is_empty() {
                println!("no agent CLIs detected");
            }
            for kind in available {
                println!("{kind}");
            }
            Ok(codes::OK)
        }
    }
}

fn build_orchestrator(
    root: &PathBuf,
    paths: &StatePaths,
    config: EngineConfig,
) -> Result<Orchestrator> {
    let available = detect_available();
    let invoker = SubprocessInvoker::new(
        config.models.clone(),
        paths.prompts_dir.clone(),
        config.output_limit_bytes,
    );
    Ok(Orchestrator::new(
        root.clone(),
        config,
        Arc::new(invoker),
        available,
    ))
}

fn cmd_status(paths: &StatePaths) -> Result<()> {
    let session = load_session(paths)?;
    println!("session:  {}", session.session_id);
    println!("goal:     {}", session.goal);
    println!("status:   {:?}", session.status);
    println!("branch:   {}", session.branch);
    println!("cycle:    {}/{}", session.current_cycle, session.max_cycles);
    println!(
        "tasks:    {} created, {} completed, {} failed",
        session.stats.tasks_created, session.stats.tasks_completed, session.stats.tasks_failed
    );
    if let Ok(pool) = load_pool(paths) {
        for (kind, state) in &pool.agents {
            println!(
                "agent {}: {:?} (success rate {:.2}, mean {:.1}s)",
                kind, state.status, state.success_rate, state.mean_duration_secs
            );
        }
    }
    Ok(())
}

fn report(result: &EngineResult) {
    println!("{}", result.message);
    println!(
        "cycles: {}, tasks: {} created / {} completed / {} failed, took {:.1}s",
        result.cycles,
        result.tasks_created,
        result.tasks_completed,
        result.tasks_failed,
        result.duration.as_secs_f64()
    );
}

fn status_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Completed => codes::OK,
        SessionStatus::Aborted => codes::ABORTED,
        SessionStatus::PausedManual | SessionStatus::PausedNoAgents | SessionStatus::PausedError => {
            codes::PAUSED
        }
        SessionStatus::Running => codes::OK,
    }
}
