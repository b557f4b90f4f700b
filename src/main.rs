//! CLI entry point for calbench.
//!
//! Loads the bench configuration, assembles a session (real or simulated
//! backend), connects the configured devices, and renders the session
//! event stream to the log until interrupted.

use anyhow::{Context, Result};
use calbench::messages::{SessionEvent, TaskEvent};
use calbench::{Session, Settings};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calbench")]
#[command(about = "Calibration bench execution core", long_about = None)]
struct Cli {
    /// Path to a TOML settings file (default: config/default.toml plus
    /// optional profile layering)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the simulated backend regardless of the configured flag
    #[arg(long)]
    simulation: bool,

    /// Override the artifact base directory
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::new(None).context("loading config/default.toml")?,
    };
    if cli.simulation {
        settings.application.simulation = true;
    }
    if let Some(dir) = cli.artifact_dir {
        settings.application.artifact_dir = dir;
    }

    info!(
        simulation = settings.application.simulation,
        devices = settings.devices.len(),
        "starting calbench"
    );

    let (session, mut events) = Session::new(&settings);
    session.connect_all().await;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            render(&event);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    session.shutdown().await;
    printer.abort();
    Ok(())
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionStateChanged {
            device,
            state,
            message,
        } => match message {
            Some(reason) => warn!(device = %device, state = %state, "{reason}"),
            None => info!(device = %device, state = %state, "state changed"),
        },
        SessionEvent::InputRequested { device, prompt } => {
            info!(device = %device, "input requested: {prompt}");
        }
        SessionEvent::Task { device, event } => match event {
            TaskEvent::Started { task, operation } => {
                info!(device = %device, task = %task, "{operation} started");
            }
            TaskEvent::Output { line, .. } => info!(device = %device, "{line}"),
            TaskEvent::Finished { task, result } if result.success => {
                info!(device = %device, task = %task, "{}", result.message);
            }
            TaskEvent::Finished { task, result } => {
                warn!(device = %device, task = %task, "{}", result.message);
            }
            TaskEvent::Failed { task, message } => {
                error!(device = %device, task = %task, "{message}");
            }
        },
    }
}
