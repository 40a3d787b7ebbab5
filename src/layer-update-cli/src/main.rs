//! Layer Updater - update agent daemon.
//!
//! `run` keeps the agent alive: a boot wake on start, periodic checks, and
//! Unix signals as external triggers:
//! - `SIGHUP` - manual update check
//! - `SIGUSR1` - network became available
//! - `SIGUSR2` - network lost, cancel the running download
//! - `SIGINT`/`SIGTERM` - flush state and exit

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use layer_update::{
    AgentConfig, CURRENT_VERSION, Scheduler, SchedulerHandle, StateStore, UpdateOrchestrator,
    WakeReason, run_startup_commands,
};

/// Layer update agent
#[derive(Parser)]
#[command(name = "layer-updater")]
#[command(about = "Resumable update agent for the Layer display package")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until interrupted
    Run {
        /// Do not start a cycle immediately
        #[arg(long)]
        no_boot_wake: bool,
    },
    /// Run a single update cycle and print its outcome
    Check,
    /// Print the persisted update state
    Status,
    /// Discard all progress and return to idle
    Reset,
}

fn setup_logging(
    level: &str,
    json: bool,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    let Some(path) = log_file else {
        if json {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            subscriber
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    if json {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer).init();
    }
    Ok(Some(guard))
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[cfg(unix)]
async fn forward_signals(handle: SchedulerHandle) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut usr2 =
        signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => handle.wake(WakeReason::Manual),
            _ = usr1.recv() => handle.wake(WakeReason::NetworkAvailable),
            _ = usr2.recv() => handle.network_lost(),
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    handle.shutdown();
    Ok(())
}

#[cfg(not(unix))]
async fn forward_signals(handle: SchedulerHandle) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down");
    handle.shutdown();
    Ok(())
}

async fn run_agent(config: &AgentConfig, boot_wake: bool) -> Result<ExitCode> {
    let orchestrator = Arc::new(UpdateOrchestrator::from_config(config).await?);
    let scheduler = Scheduler::new(orchestrator, config.check_interval());
    let handle = scheduler.handle();

    info!(
        version = CURRENT_VERSION,
        manifest = %config.manifest_url,
        state_dir = %config.state_dir().display(),
        "Layer updater started"
    );

    run_startup_commands(&config.installer).await;

    if boot_wake {
        handle.wake(WakeReason::Boot);
    }

    let signals = tokio::spawn({
        let handle = handle.clone();
        async move {
            if let Err(e) = forward_signals(handle.clone()).await {
                error!("Signal handling failed: {:#}", e);
                handle.shutdown();
            }
        }
    });

    let result = scheduler.run().await;
    signals.abort();
    result?;

    info!("Layer updater stopped");
    Ok(ExitCode::SUCCESS)
}

async fn check_once(config: &AgentConfig) -> Result<ExitCode> {
    let orchestrator = UpdateOrchestrator::from_config(config).await?;
    let outcome = orchestrator.run_cycle(WakeReason::Manual).await;
    orchestrator.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn print_status(config: &AgentConfig) -> Result<ExitCode> {
    let store = StateStore::new(config.state_dir());
    match store.read().await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("No update state recorded at {}", store.path().display()),
    }
    Ok(ExitCode::SUCCESS)
}

async fn reset_state(config: &AgentConfig) -> Result<ExitCode> {
    let orchestrator = UpdateOrchestrator::from_config(config).await?;
    orchestrator.reset().await?;
    println!("Update state reset");
    Ok(ExitCode::SUCCESS)
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run { no_boot_wake } => run_agent(&config, !no_boot_wake).await,
        Command::Check => check_once(&config).await,
        Command::Status => print_status(&config).await,
        Command::Reset => reset_state(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match setup_logging(&args.log_level, args.json_logs, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
