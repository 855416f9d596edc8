//! FleetMQ - in-memory message broker for distributed agent fleets.

use clap::Parser;
use std::process::ExitCode;

mod bridge;
mod broker;
mod cli;
mod config;
mod consumer;
mod crypto;
mod error;
mod logging;
mod protocol;

use cli::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; the guard must live until exit so the file
    // writer keeps flushing.
    let _guard = match logging::init() {
        Ok((guard, _log_dir)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Parse command line arguments
    let args = Commands::parse();

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
