//! Timer loops for reconciliation and statistics.
//!
//! Each loop awaits its own work before waiting for the next tick, so a slow
//! pass delays the next one instead of overlapping it. Shutdown is only
//! observed while waiting: an in-flight pass always runs to completion.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::Reconciler;
use crate::signal::ShutdownToken;
use crate::stats::StatisticsReader;

pub struct Scheduler {
    engine: Arc<Reconciler>,
    reader: Arc<StatisticsReader>,
    refresh_interval: Duration,
    stats_interval: Duration,
}

/// Running scheduler loops
pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Reconciler>,
        reader: Arc<StatisticsReader>,
        refresh_interval: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            engine,
            reader,
            refresh_interval,
            stats_interval,
        }
    }

    /// Start both loops. The first reconciliation tick comes one refresh
    /// interval from now (startup already ran a pass); the first statistics
    /// poll is immediate.
    pub fn spawn(self, shutdown: ShutdownToken) -> SchedulerHandle {
        info!(
            "Scheduler started: refresh every {:?}, statistics every {:?}",
            self.refresh_interval, self.stats_interval
        );

        let reconcile = tokio::spawn(reconcile_loop(
            self.engine,
            self.refresh_interval,
            shutdown.clone(),
        ));
        let stats = tokio::spawn(stats_loop(self.reader, self.stats_interval, shutdown));

        SchedulerHandle {
            tasks: vec![reconcile, stats],
        }
    }
}

impl SchedulerHandle {
    /// Wait for both loops to exit
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler task panicked: {}", e);
            }
        }
    }
}

async fn reconcile_loop(engine: Arc<Reconciler>, period: Duration, mut shutdown: ShutdownToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Failures are logged and recorded by the engine; retry next tick
        let _ = engine.reconcile().await;
    }
    debug!("Reconciliation loop stopped");
}

async fn stats_loop(reader: Arc<StatisticsReader>, period: Duration, mut shutdown: ShutdownToken) {
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Logged by the reader; the hub keeps the previous values
        let _ = reader.poll().await;
    }
    debug!("Statistics loop stopped");
}
