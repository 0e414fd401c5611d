use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use drover::config::{EngineConfig, ExecutorConfig, PoolConfig};
use drover::dashboard::{run_dashboard, DashboardState};
use drover::engine::Engine;
use drover::error::DroverError;
use drover::scheduler::{Job, JobSpec};
use drover::shutdown::install_shutdown_handler;
use drover::worker::build_pool;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "Queue-and-pool task scheduler running commands on remote targets")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler over a worker pool
    Run(RunArgs),

    /// Check a job file without running it
    Validate {
        /// Path to the job JSON file
        job: PathBuf,

        /// Output format
        #[arg(long, short = 'o', value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the pool JSON file
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Job JSON files to submit at startup (repeatable)
    #[arg(long = "job")]
    jobs: Vec<PathBuf>,

    /// Queue to submit jobs to
    #[arg(long, default_value = "default")]
    queue: String,

    /// Scheduling cycle period in milliseconds
    #[arg(long, default_value = "5000")]
    period_ms: u64,

    /// Results polling interval in milliseconds
    #[arg(long, default_value = "2000")]
    poll_ms: u64,

    /// Directory on each target for runner, script, results and log files
    #[arg(long, default_value = "/tmp")]
    work_dir: String,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Serialize)]
struct ValidateOutput {
    label: String,
    tasks: usize,
    commands: usize,
}

// =============================================================================
// Run
// =============================================================================

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let executor = ExecutorConfig::default()
        .with_poll_interval(Duration::from_millis(args.poll_ms))
        .with_work_dir(args.work_dir);
    let config = EngineConfig::default()
        .with_scheduler_period(Duration::from_millis(args.period_ms))
        .with_executor(executor);

    let pool_config = PoolConfig::from_file(&args.config)?;
    let pool = build_pool(&pool_config, &config.executor)?;
    let engine = Arc::new(Engine::new(config, pool));

    for path in &args.jobs {
        let job = load_job(path)?;
        let label = job.label().to_string();
        let job_id = engine.add_job(&args.queue, job).await?;
        tracing::info!(job_id = %job_id, label = %label, path = %path.display(), "Submitted job");
    }

    if let Some(port) = args.dashboard_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let state = DashboardState {
            engine: engine.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let shutdown = install_shutdown_handler();
    if let Err(e) = engine.run(shutdown).await {
        tracing::error!(error = %e, "Scheduler failed, exiting");
        std::process::exit(1);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn load_job(path: &Path) -> Result<Job, DroverError> {
    let content = std::fs::read_to_string(path)?;
    let spec: JobSpec = serde_json::from_str(&content)?;
    Job::from_spec(spec)
}

async fn validate(path: &Path, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let job = load_job(path)?;
    let mut commands = 0;
    for task in job.tasks() {
        commands += task.len().await;
    }
    let summary = ValidateOutput {
        label: job.label().to_string(),
        tasks: job.tasks().len(),
        commands,
    };

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("{:<30} {:>6} {:>9}", "LABEL", "TASKS", "COMMANDS");
            println!("{}", "-".repeat(47));
            println!(
                "{:<30} {:>6} {:>9}",
                summary.label, summary.tasks, summary.commands
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Validate { job, output } => validate(&job, output).await?,
    }

    Ok(())
}
