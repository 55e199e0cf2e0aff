//! trial-forge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trial_forge::controller::EXIT_FAILED_TO_START;

#[tokio::main]
async fn main() {
    // Parse CLI arguments first to get log_level
    let cli = trial_forge::cli::parse_cli();

    // Initialize tracing with environment filter
    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let code = match trial_forge::cli::run_with_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "Command failed");
            eprintln!("Error: {:#}", err);
            EXIT_FAILED_TO_START
        }
    };
    std::process::exit(code);
}
