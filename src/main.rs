use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use patient_intake::admission::{
    build_admission, AdmissionChannel, InMemoryAdmissionChannel, TokenDripper,
};
use patient_intake::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use patient_intake::config::{IntakeConfig, LimiterMode};
use patient_intake::errors::IntakeError;
use patient_intake::gateway::HttpActivityGateway;
use patient_intake::loader::run_batch;
use patient_intake::observability::intake_metrics;
use patient_intake::shutdown::{ShutdownCoordinator, ShutdownSignal};
use patient_intake::telemetry::init_telemetry;
use patient_intake::workflows::PatientIntakeSaga;

#[derive(Parser)]
#[command(name = "patient-intake")]
#[command(about = "Patient document intake with shared admission control")]
#[command(long_about = "Runs the patient document intake saga: identity lookup, task creation, \
                       document search, polling, download and bounded conversion. Outbound calls to \
                       rate-limited services wait for tokens emitted by the token dripper.")]
struct Cli {
    /// Configuration file (defaults to ./patient-intake.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the intake for a single patient
    Run {
        #[arg(long, help = "Patient identifier, e.g. P00042")]
        patient_id: String,
    },
    /// Start many intakes at a steady rate
    Load {
        #[arg(long, default_value = "25", help = "Number of intakes to start")]
        n: usize,
        #[arg(long, default_value = "2.0", help = "Intakes started per second")]
        rate: f64,
    },
    /// Run the token dripper against the shared admission database
    Drip,
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    IntakeConfig::load_env_file()?;
    let config = match &cli.config {
        Some(path) => IntakeConfig::load_from(path),
        None => IntakeConfig::load(),
    }
    .context("failed to load configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_telemetry(&config.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async move {
        let coordinator = ShutdownCoordinator::new();
        let _signals = coordinator.install_signal_handlers();

        let result = match cli.command {
            Commands::Run { patient_id } => run_command(&config, &coordinator, &patient_id).await,
            Commands::Load { n, rate } => load_command(&config, &coordinator, n, rate).await,
            Commands::Drip => drip_command(&config, coordinator.signal()).await,
            Commands::Config => Ok(()),
        };

        intake_metrics().log_stats();
        result
    })
}

async fn run_command(
    config: &IntakeConfig,
    coordinator: &ShutdownCoordinator,
    patient_id: &str,
) -> Result<()> {
    let (saga, dripper) = build_saga(config, coordinator.signal()).await?;
    let result = saga.run(patient_id).await;
    stop_dripper(coordinator, dripper).await;

    let state = result?;
    println!(
        "{}: {} (task {}, {} document(s))",
        patient_id,
        state
            .outcome()
            .map(|outcome| outcome.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        state
            .task_id()
            .map(|task| task.to_string())
            .unwrap_or_default(),
        state.converted().len()
    );
    Ok(())
}

async fn load_command(
    config: &IntakeConfig,
    coordinator: &ShutdownCoordinator,
    n: usize,
    rate: f64,
) -> Result<()> {
    let (saga, dripper) = build_saga(config, coordinator.signal()).await?;
    let summary = run_batch(Arc::new(saga), n, rate, &coordinator.signal()).await;
    stop_dripper(coordinator, dripper).await;

    let summary = summary?;
    println!(
        "started {}: found {}, not found {}, failed {}, cancelled {}",
        summary.total(),
        summary.found,
        summary.not_found,
        summary.failed,
        summary.cancelled
    );
    Ok(())
}

async fn drip_command(config: &IntakeConfig, shutdown: ShutdownSignal) -> Result<()> {
    let url = config
        .limiter
        .database_url
        .as_deref()
        .context("`drip` needs limiter.database_url so workers can share its tokens")?;
    let channel = shared_channel(url, config.limiter.retained_tokens).await?;
    let dripper = TokenDripper::new(
        channel,
        config.limiter.parsed_rates()?,
        config.dripper.tick(),
        config.dripper.jitter_fraction,
    )?;
    dripper.run(shutdown).await?;
    Ok(())
}

/// Wire gateway, admission and checkpoints. Spawns an in-process dripper when
/// the limiter is on but no shared token database is configured.
async fn build_saga(
    config: &IntakeConfig,
    shutdown: ShutdownSignal,
) -> Result<(PatientIntakeSaga, Option<JoinHandle<Result<(), IntakeError>>>)> {
    let mut dripper = None;
    let channel: Option<Arc<dyn AdmissionChannel>> = match config.limiter.mode {
        LimiterMode::None => None,
        LimiterMode::Dripper => match config.limiter.database_url.as_deref() {
            Some(url) => Some(shared_channel(url, config.limiter.retained_tokens).await?),
            None => {
                let channel: Arc<dyn AdmissionChannel> =
                    Arc::new(InMemoryAdmissionChannel::new(config.limiter.retained_tokens));
                let local = TokenDripper::new(
                    channel.clone(),
                    config.limiter.parsed_rates()?,
                    config.dripper.tick(),
                    config.dripper.jitter_fraction,
                )?;
                info!("No shared admission database configured; dripping in-process");
                dripper = Some(tokio::spawn(local.run(shutdown.clone())));
                Some(channel)
            }
        },
    };

    let admission = build_admission(
        config.limiter.mode,
        channel,
        config.limiter.release_jitter(),
    )?;
    let gateway = Arc::new(
        HttpActivityGateway::new(&config.services, admission)?.with_shutdown(shutdown.clone()),
    );
    let checkpoints: Arc<dyn CheckpointStore> = match &config.saga.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
        None => Arc::new(InMemoryCheckpointStore::new()),
    };

    let saga = PatientIntakeSaga::new(gateway, checkpoints, config.saga.clone(), shutdown);
    Ok((saga, dripper))
}

async fn stop_dripper(
    coordinator: &ShutdownCoordinator,
    dripper: Option<JoinHandle<Result<(), IntakeError>>>,
) {
    if let Some(handle) = dripper {
        coordinator.trigger();
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Token dripper stopped with an error"),
            Err(e) => warn!(error = %e, "Token dripper task failed"),
        }
    }
}

#[cfg(feature = "database")]
async fn shared_channel(url: &str, retained: usize) -> Result<Arc<dyn AdmissionChannel>> {
    let channel =
        patient_intake::admission::sqlite::SqliteAdmissionChannel::connect(url, retained).await?;
    Ok(Arc::new(channel))
}

#[cfg(not(feature = "database"))]
async fn shared_channel(_url: &str, _retained: usize) -> Result<Arc<dyn AdmissionChannel>> {
    anyhow::bail!("limiter.database_url requires building with the `database` feature")
}
