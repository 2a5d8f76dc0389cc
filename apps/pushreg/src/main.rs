use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    HttpRegistrationBackend, HttpSessionSource, OrchestratorConfig, PipelineOutcome,
    RegistrationChange, RegistrationDependencies, RegistrationOrchestrator, RegistrationState,
    StaticCredentialSource,
};
use shared::domain::{DeviceIdentity, DeviceToken};
use tokio::sync::{broadcast, broadcast::error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Inspect or toggle push registration against a registry server")]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    identity: String,
    #[arg(long, default_value = "desktop")]
    device_name: String,
    /// Device token handed to the registries; omit to simulate a denied
    /// notification permission.
    #[arg(long)]
    device_token: Option<String>,
    #[arg(long, default_value = "gateway")]
    primary_registry: String,
    #[arg(long, default_value = "directory")]
    secondary_registry: String,
    #[arg(long, default_value_t = 3000)]
    settle_delay_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Refresh and print the reconciled state.
    Status,
    /// Register this device with both registries.
    Enable,
    /// Remove this device from both registries.
    Disable,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let orchestrator = build_orchestrator(&args)?;
    let change_log = tokio::spawn(log_changes(orchestrator.subscribe()));

    let outcome = run(&orchestrator, args.command).await;
    let state = orchestrator.snapshot().await;

    // Releasing the last handle closes the change channel, so the log task
    // drains what is buffered and then exits.
    orchestrator.shutdown().await;
    drop(orchestrator);
    change_log.await?;

    print_state(&state);
    match outcome {
        PipelineOutcome::Completed | PipelineOutcome::Skipped(_) => Ok(()),
        PipelineOutcome::Rejected
        | PipelineOutcome::Failed { .. }
        | PipelineOutcome::Aborted => bail!(
            "{}",
            state
                .error_message
                .unwrap_or_else(|| "registration pipeline did not complete".to_string())
        ),
    }
}

fn build_orchestrator(args: &Args) -> Result<Arc<RegistrationOrchestrator>> {
    let dependencies = RegistrationDependencies {
        sessions: Arc::new(HttpSessionSource::new(
            &args.server_url,
            args.device_name.clone(),
        )?),
        credentials: Arc::new(StaticCredentialSource::new(
            args.device_token.clone().map(DeviceToken::new),
        )),
        primary: Arc::new(HttpRegistrationBackend::new(
            &args.server_url,
            args.primary_registry.clone(),
        )?),
        secondary: Arc::new(HttpRegistrationBackend::new(
            &args.server_url,
            args.secondary_registry.clone(),
        )?),
    };
    Ok(RegistrationOrchestrator::new_with_config(
        DeviceIdentity::new(args.identity.clone()),
        dependencies,
        OrchestratorConfig {
            session_settle_delay: Duration::from_millis(args.settle_delay_ms),
        },
    ))
}

async fn log_changes(mut changes: broadcast::Receiver<RegistrationChange>) {
    loop {
        match changes.recv().await {
            Ok(change) => info!(?change, "registration state changed"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "change log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Toggles only act on a freshly reconciled state, so every command starts
/// with a refresh.
async fn run(orchestrator: &Arc<RegistrationOrchestrator>, command: Command) -> PipelineOutcome {
    let refreshed = orchestrator.refresh().await;
    if !matches!(refreshed, PipelineOutcome::Completed) {
        return refreshed;
    }
    match command {
        Command::Status => refreshed,
        Command::Enable => orchestrator.set_desired_state(true).await,
        Command::Disable => orchestrator.set_desired_state(false).await,
    }
}

fn print_state(state: &RegistrationState) {
    println!("registered: {}", state.is_registered);
    if let Some(info) = &state.info_message {
        println!("info: {info}");
    }
    if let Some(error) = &state.error_message {
        println!("error: {error}");
    }
}
