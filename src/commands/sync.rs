//! Sync command: one reconciliation pass.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::load_settings;
use crate::cli::GlobalOptions;
use crate::config::Backend;
use crate::engine::{PassReport, Plan, Reconciler};
use crate::enforcer::{check_root, open_persistent_store};
use crate::fetcher::{FeedSource, HttpFeedSource};
use crate::hub::ObservabilityHub;
use crate::lock::LockGuard;
use crate::policy::{PolicyDiff, SetKey};
use crate::utils::format_count;

/// Run the sync command
pub async fn run(dry_run: bool, options: &GlobalOptions) -> Result<()> {
    let settings = load_settings(options)?;
    let config = super::load_config(options)?;

    if settings.backend != Backend::Memory {
        check_root()?;
    }
    let _lock = if dry_run {
        None
    } else {
        Some(LockGuard::acquire(&settings.lock_file)?)
    };

    let store = open_persistent_store(&config)?;
    let feeds: Arc<dyn FeedSource> = Arc::new(HttpFeedSource::new(settings.feed.clone())?);
    let hub = Arc::new(ObservabilityHub::new(
        settings.mode.action(),
        settings.countries.iter().copied(),
    ));
    let engine = Reconciler::new(&settings, store, feeds, hub);

    if dry_run {
        let plan = engine.plan().await.context("Planning failed")?;
        print_plan(&plan);
        return Ok(());
    }

    let report = engine.reconcile().await.context("Synchronization failed")?;
    print_report(&report);
    Ok(())
}

/// Entry counts per set: (to add, to remove)
fn per_set(diff: &PolicyDiff) -> BTreeMap<SetKey, (usize, usize)> {
    let mut sets: BTreeMap<SetKey, (usize, usize)> = BTreeMap::new();
    for entry in &diff.to_add {
        sets.entry(entry.set_key()).or_default().0 += 1;
    }
    for entry in &diff.to_remove {
        sets.entry(entry.set_key()).or_default().1 += 1;
    }
    sets
}

fn print_plan(plan: &Plan) {
    println!("[DRY-RUN] No changes applied");
    println!(
        " Desired: {} entries from {} countries",
        format_count(plan.desired.len() as u64),
        plan.desired.countries().len()
    );
    for failure in &plan.failed {
        println!(" [SKIP] {}", failure);
    }
    if plan.diff.is_empty() {
        println!(" Backend already up to date");
        return;
    }
    for (set, (add, remove)) in per_set(&plan.diff) {
        println!(" {:<12} +{:<8} -{}", set.set_name(), add, remove);
    }
    for entry in &plan.diff.to_add {
        debug!("+ {}", entry);
    }
    for entry in &plan.diff.to_remove {
        debug!("- {}", entry);
    }
}

fn print_report(report: &PassReport) {
    for failure in &report.failed {
        println!("[SKIP] {}", failure);
    }
    for failure in &report.failed_entries {
        println!("[FAIL] {}", failure);
    }
    println!(
        "[OK] {} entries enforced (+{} -{}) in {:.1?}",
        format_count(report.desired as u64),
        report.added,
        report.removed,
        report.duration
    );
}
