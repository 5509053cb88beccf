//! tapvm CLI entry point.

use clap::Parser;
use std::path::PathBuf;
use tapvm::config::VmConfig;
use tracing_subscriber::EnvFilter;

/// tapvm - TOML-configured QEMU supervisor
#[derive(Parser, Debug)]
#[command(name = "tapvm")]
#[command(about = "Supervise one QEMU microVM with tap networking")]
#[command(version)]
struct Cli {
    /// Config file to load.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = tapvm::VERSION, "starting tapvm");

    let config = match VmConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match tapvm::supervisor::run(config).await {
        // The child's classified exit code becomes ours.
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "supervisor failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tapvm=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
