//! CLI entry point: `amnesic <mission> [--root <dir>] [--model <name>]
//! [--provider <name>] [--turns <int>]`.
//!
//! Exits 0 on an orderly halt (the mission concluded, whether by
//! `halt_and_ask` or a policy halt) and non-zero on a kernel panic (the
//! recursion limit, a cancelled driver call, or a setup failure).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use amnesic_kernel::config::KernelConfig;
use amnesic_kernel::drivers;
use amnesic_kernel::embedding::{Embedder, FastEmbedEmbedder, HashEmbedder};
use amnesic_kernel::session::{Session, TurnOutcome};
use amnesic_kernel::sidecar::Sidecar;

#[derive(Parser, Debug)]
#[command(name = "amnesic", version, about = "Orchestration kernel for stateful, tool-using LLM agents")]
struct Cli {
    /// The mission statement handed to the agent.
    mission: String,

    /// Workspace root(s) the session is allowed to read and write.
    #[arg(long = "root", default_value = ".")]
    roots: Vec<PathBuf>,

    /// The model name passed through to the selected driver.
    #[arg(long, default_value = "local")]
    model: String,

    /// The driver to dispatch to: ollama|openai|anthropic|gemini|local.
    #[arg(long, default_value = "local")]
    provider: String,

    /// Hard cap on proposer→gatekeeper→effector cycles (the recursion limit).
    #[arg(long, default_value_t = 50)]
    turns: u32,

    /// Directory backing the shared Sidecar's persistence and vector index.
    #[arg(long, default_value = ".amnesic_cache")]
    cache_dir: PathBuf,

    /// Run with no disk access; tool calls are confined to an in-memory
    /// shadow filesystem.
    #[arg(long)]
    sandbox: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let cli = Cli::parse();

    let mut config = KernelConfig::default();
    config.mission = cli.mission.clone();
    config.root_dirs = cli.roots;
    config.model_name = cli.model.clone();
    config.provider = cli.provider.clone();
    config.recursion_limit = cli.turns;
    config.sandbox = cli.sandbox;

    let driver: Arc<dyn drivers::LlmDriver> = match drivers::build(&cli.provider, &cli.model, None) {
        Ok(driver) => Arc::from(driver),
        Err(e) => {
            error!(error = %e, provider = %cli.provider, "failed to build driver");
            return ExitCode::FAILURE;
        }
    };

    let embedder: Arc<dyn Embedder> = match FastEmbedEmbedder::try_new() {
        Ok(e) => Arc::new(e),
        Err(e) => {
            warn!(error = %e, "fastembed unavailable, falling back to the deterministic hash embedder");
            Arc::new(HashEmbedder)
        }
    };

    let sidecar = match Sidecar::open(&cli.cache_dir) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            error!(error = %e, path = %cli.cache_dir.display(), "failed to open sidecar cache directory");
            return ExitCode::FAILURE;
        }
    };

    let mut session = Session::new(config, driver, embedder, sidecar);

    info!(mission = %cli.mission, turns = cli.turns, "starting session");
    match session.run().await {
        TurnOutcome::Halted(msg) => {
            info!(message = %msg, "session halted");
            println!("{msg}");
            ExitCode::SUCCESS
        }
        TurnOutcome::Cancelled(msg) => {
            error!(message = %msg, "kernel panic");
            eprintln!("kernel panic: {msg}");
            ExitCode::FAILURE
        }
        TurnOutcome::Continue => {
            // run() only returns Continue if the recursion limit is 0.
            error!("session ended mid-cycle with no recursion budget");
            ExitCode::FAILURE
        }
    }
}
