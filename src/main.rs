//! geogate - country-based IPv4 access policy for Linux hosts
//!
//! Keeps XDP or nftables state in line with per-country CIDR feeds.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use geogate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.options.verbose {
        Level::DEBUG
    } else if cli.options.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => geogate::commands::run::run(&cli.options).await,
        Commands::Sync { dry_run } => geogate::commands::sync::run(dry_run, &cli.options).await,
        Commands::Stats { json } => geogate::commands::stats::run(json, &cli.options).await,
        Commands::Reset => geogate::commands::reset::run(&cli.options).await,
        Commands::Version => {
            println!("geogate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
