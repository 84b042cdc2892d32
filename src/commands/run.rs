//! Run command: the long-lived daemon.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::load_settings;
use crate::cli::GlobalOptions;
use crate::config::{Backend, Settings};
use crate::engine::Reconciler;
use crate::enforcer::{check_root, create_store};
use crate::fetcher::{FeedSource, HttpFeedSource};
use crate::hub::ObservabilityHub;
use crate::lock::LockGuard;
use crate::scheduler::Scheduler;
use crate::server;
use crate::signal::Shutdown;
use crate::stats::StatisticsReader;
use crate::utils::format_duration;

/// Run the run command
pub async fn run(options: &GlobalOptions) -> Result<()> {
    let settings = load_settings(options)?;

    if settings.backend != Backend::Memory {
        check_root()?;
    }
    let _lock = LockGuard::acquire(&settings.lock_file)?;

    log_startup(&settings);

    // Dropping the store on any exit path below releases the backend (for
    // xdp: detaches the program)
    let store = create_store(&settings)?;
    let feeds: Arc<dyn FeedSource> = Arc::new(HttpFeedSource::new(settings.feed.clone())?);
    let hub = Arc::new(ObservabilityHub::new(
        settings.mode.action(),
        settings.countries.iter().copied(),
    ));
    let engine = Arc::new(Reconciler::new(&settings, store.clone(), feeds, hub.clone()));

    engine
        .bootstrap()
        .await
        .context("Initial synchronization failed")?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let server = match settings.metrics_addr {
        Some(addr) => {
            let listener = server::bind(addr).await?;
            Some(tokio::spawn(server::serve(listener, hub.clone(), shutdown.token())))
        }
        None => None,
    };

    let reader = Arc::new(StatisticsReader::new(store.clone(), hub));
    let scheduler = Scheduler::new(
        engine,
        reader,
        settings.refresh_interval,
        settings.stats_interval,
    )
    .spawn(shutdown.token());

    let mut token = shutdown.token();
    token.cancelled().await;

    info!("Shutting down, waiting for in-flight work...");
    scheduler.join().await;
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{:#}", e),
            Err(e) => warn!("Metrics endpoint task failed: {}", e),
        }
    }

    if settings.reset_on_exit {
        store
            .reset()
            .await
            .context("Failed to remove enforcement state on exit")?;
        info!("Removed enforcement state from {} backend", store.name());
    }

    info!("geogate stopped");
    Ok(())
}

fn log_startup(settings: &Settings) {
    let countries: Vec<&str> = settings.countries.iter().map(|cc| cc.as_str()).collect();
    info!(
        "Starting geogate {}: {} mode for [{}], {} backend, {} layout, refresh every {}",
        env!("CARGO_PKG_VERSION"),
        settings.mode,
        countries.join(", "),
        settings.backend.as_str(),
        settings.layout,
        format_duration(settings.refresh_interval)
    );
}
