use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use walvault::{
    config::{AppConfig, Args},
    handlers::{self, AppState, Outcome},
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // --- Logging setup ---
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // --- Resolve config ---
    let cfg = match AppConfig::load(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("invalid configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!("Starting walvault with config: {:?}", cfg);

    // --- Run the requested operation ---
    let operation = args.command.name();
    let state = AppState::connect(cfg).await;
    match handlers::dispatch(&state, &args.command).await {
        Ok(Outcome::Completed { subject, bytes }) => {
            tracing::info!(operation, subject = %subject, bytes, "operation completed");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Skipped { reason }) => {
            tracing::info!(operation, "nothing to do: {}", reason);
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(operation, "{} failed: {}", operation, err);
            ExitCode::FAILURE
        }
    }
}
