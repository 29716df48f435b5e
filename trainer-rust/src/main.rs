mod config;
mod error;
mod experiments;
mod replay;
mod runlog;
mod storage;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use config::TrainConfig;
use experiments::dispatch::CancelToken;
use experiments::trainer::TrainingLoop;
use runlog::SaveDir;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "caterpillar-trainer", about = "Symmetric PEPG training for caterpillar locomotion", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a feedback policy
    Train(TrainArgs),
    /// Run a saved policy and record its trajectory
    Replay(ReplayArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// JSON config file; missing fields keep their defaults
    #[arg(long, env = "CATERPILLAR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    episodes: Option<usize>,

    /// Antithetic pairs per episode (2x rollouts)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Rollout worker threads
    #[arg(long, env = "CATERPILLAR_WORKERS")]
    workers: Option<usize>,

    /// Simulation steps per rollout
    #[arg(long)]
    steps: Option<usize>,

    /// Policy key (linear, open_loop)
    #[arg(long)]
    policy: Option<String>,

    /// Parent of the timestamped run directory
    #[arg(long, env = "CATERPILLAR_OUT_DIR", default_value = "runs")]
    out_dir: PathBuf,

    #[arg(long)]
    seed: Option<u64>,

    /// Continue from an optimizer_state.json
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl TrainArgs {
    fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = self.episodes {
            cfg.episodes = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.steps {
            cfg.steps = v;
        }
        if let Some(v) = &self.policy {
            cfg.policy = v.clone();
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
    }
}

#[derive(Args)]
struct ReplayArgs {
    /// optimizer_state.json or actor_params.json
    model: PathBuf,

    /// JSON config describing the body; defaults otherwise
    #[arg(long, env = "CATERPILLAR_CONFIG")]
    config: Option<PathBuf>,

    /// Defaults to the config's default_sample_steps
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // Ctrl-C interrupts the current batch instead of killing the process
    let cancel = CancelToken::new();
    let listener = cancel.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl-C: {e}");
                return;
            }
            tracing::info!("Received SIGINT");
            listener.cancel();
        }
    });

    match cli.command {
        Command::Train(args) => train(args, cancel).await,
        Command::Replay(args) => replay_model(args, cancel).await,
    }
}

async fn train(args: TrainArgs, cancel: CancelToken) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    args.apply(&mut cfg);

    let resume = match &args.resume {
        Some(path) => {
            let snapshot = storage::load_snapshot(path)
                .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
            if args.policy.is_none() {
                cfg.policy = snapshot.policy.clone();
            }
            if args.batch_size.is_some_and(|b| b != snapshot.batch_size) {
                tracing::warn!(batch_size = snapshot.batch_size, "Resuming with the snapshot's batch size");
            }
            snapshot.restore_into(&mut cfg);
            Some(snapshot)
        }
        None => None,
    };
    cfg.validate().context("Invalid configuration")?;

    let save_dir = SaveDir::create(&args.out_dir).context("Failed to create run directory")?;
    let config_path = save_dir.log_dir().join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&cfg)?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("{cfg}");

    tracing::info!(
        version = %VERSION,
        run_dir = %save_dir.root().display(),
        episodes = cfg.episodes,
        "Starting training"
    );

    let summary = tokio::task::spawn_blocking(move || {
        TrainingLoop::new(cfg, save_dir, cancel, io::stdin().lock(), io::stdout().lock(), resume)?.run()
    })
    .await
    .context("Training task panicked")??;

    tracing::info!(
        episodes = summary.episodes,
        last_distance = ?summary.last_distance,
        state = %summary.snapshot_path.display(),
        model = %summary.policy_path.display(),
        "Done"
    );
    Ok(())
}

async fn replay_model(args: ReplayArgs, cancel: CancelToken) -> Result<()> {
    let cfg = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    cfg.validate().context("Invalid configuration")?;
    let record = storage::load_policy(&args.model)
        .with_context(|| format!("Failed to load model {}", args.model.display()))?;
    let steps = args.steps.unwrap_or(cfg.default_sample_steps);

    let outcome = tokio::task::spawn_blocking(move || {
        replay::replay(&cfg, &record, steps, &args.out_dir, &cancel)
    })
    .await
    .context("Replay task panicked")??;

    println!("Moved distance: {}", outcome.distance);
    tracing::info!(
        trace = %outcome.trace_path.display(),
        distances = %outcome.distance_path.display(),
        "Replay saved"
    );
    Ok(())
}
