//! Reconciliation engine.
//!
//! One pass: fetch every configured country's feed, build the desired entry
//! set, snapshot the backend, diff the two and apply only the difference.
//! Passes are serialized; the statistics reader is not blocked by them.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::enforcer::EnforcementStore;
use crate::error::{FailedMutation, FeedError, FeedFetchError, ReconcileError, StoreError};
use crate::feed::parse_feed_with_summary;
use crate::fetcher::FeedSource;
use crate::hub::{ObservabilityHub, PassRecord};
use crate::policy::{CountryCode, DesiredState, EntrySet, Group, Mode, PolicyDiff, Prefix, SetLayout};

/// Where the engine currently is in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Diffing,
    Applying,
    /// The last pass failed; the next tick starts over
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Diffing => "diffing",
            Phase::Applying => "applying",
            Phase::Failed => "failed",
        })
    }
}

/// Desired state and diff computed by a pass, before applying
#[derive(Debug)]
pub struct Plan {
    pub desired: DesiredState,
    pub diff: PolicyDiff,
    pub failed: Vec<FeedFetchError>,
}

/// Result of a pass that reached the backend
#[derive(Debug)]
pub struct PassReport {
    pub fetched: BTreeSet<CountryCode>,
    pub failed: Vec<FeedFetchError>,
    pub desired: usize,
    pub added: usize,
    pub removed: usize,
    /// Entries the backend rejected; the rest of the diff was applied
    pub failed_entries: Vec<FailedMutation>,
    pub duration: Duration,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.failed_entries.is_empty()
    }
}

/// Which live entries a pass may withdraw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Only groups of the configured countries and layout
    Configured,
    /// Everything the backend holds for geogate
    Owned,
}

pub struct Reconciler {
    store: Arc<dyn EnforcementStore>,
    feeds: Arc<dyn FeedSource>,
    hub: Arc<ObservabilityHub>,
    mode: Mode,
    layout: SetLayout,
    countries: BTreeSet<CountryCode>,
    max_concurrent: usize,
    /// Held for a whole pass: passes never overlap
    pass_lock: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
}

impl Reconciler {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn EnforcementStore>,
        feeds: Arc<dyn FeedSource>,
        hub: Arc<ObservabilityHub>,
    ) -> Self {
        Self {
            store,
            feeds,
            hub,
            mode: settings.mode,
            layout: settings.layout,
            countries: settings.countries.clone(),
            max_concurrent: settings.feed.max_concurrent.max(1),
            pass_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        debug!("Reconciler phase: {}", phase);
        *self.phase.lock() = phase;
    }

    /// Startup pass. Every feed is fetched before the backend is touched, so
    /// a failure here leaves the previous run's entries in place. Leftovers
    /// of earlier runs (other countries, the other layout) are withdrawn by
    /// the same diff instead of a reset. Any error here should stop the
    /// process.
    pub async fn bootstrap(&self) -> Result<PassReport, ReconcileError> {
        info!("Initial synchronization on {} backend", self.store.name());
        self.pass(Scope::Owned).await
    }

    /// Run one full pass.
    ///
    /// A partially applied diff is still a successful pass: the rejected
    /// entries are logged and listed in the report.
    pub async fn reconcile(&self) -> Result<PassReport, ReconcileError> {
        self.pass(Scope::Configured).await
    }

    async fn pass(&self, scope: Scope) -> Result<PassReport, ReconcileError> {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();

        let result = self.run_pass(scope, started).await;
        match &result {
            Ok(report) => {
                self.set_phase(Phase::Idle);
                self.hub.record_pass(&PassRecord {
                    fetched: report.fetched.clone(),
                    failed: report.failed.iter().map(|e| e.country).collect(),
                    failed_entries: report.failed_entries.len(),
                    finished_at: Utc::now(),
                });
                info!(
                    "Reconciliation complete: {} entries desired, +{} -{}, {} countries skipped, {} entries failed ({:.1?})",
                    report.desired,
                    report.added,
                    report.removed,
                    report.failed.len(),
                    report.failed_entries.len(),
                    report.duration
                );
            }
            Err(e) => {
                self.set_phase(Phase::Failed);
                self.hub.record_failure();
                error!("Reconciliation failed: {}", e);
            }
        }
        result
    }

    /// Fetch, snapshot and diff without touching the backend
    pub async fn plan(&self) -> Result<Plan, ReconcileError> {
        let _pass = self.pass_lock.lock().await;
        let plan = self.build_plan(Scope::Configured).await;
        self.set_phase(if plan.is_ok() { Phase::Idle } else { Phase::Failed });
        plan
    }

    async fn run_pass(&self, scope: Scope, started: Instant) -> Result<PassReport, ReconcileError> {
        let plan = self.build_plan(scope).await?;
        let Plan {
            desired,
            diff,
            failed,
        } = plan;

        let mut report = PassReport {
            fetched: desired.countries().clone(),
            failed,
            desired: desired.len(),
            added: diff.to_add.len(),
            removed: diff.to_remove.len(),
            failed_entries: Vec::new(),
            duration: Duration::ZERO,
        };

        if diff.is_empty() {
            debug!("Backend already matches desired state");
        } else {
            self.set_phase(Phase::Applying);
            match self.store.apply_diff(&diff).await {
                Ok(()) => {}
                Err(StoreError::PartialApply(partial)) => {
                    for failure in &partial.failed {
                        warn!("Failed to apply entry: {}", failure);
                    }
                    report.failed_entries = partial.failed;
                }
                Err(e) => return Err(ReconcileError::Apply(e)),
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    async fn build_plan(&self, scope: Scope) -> Result<Plan, ReconcileError> {
        self.set_phase(Phase::Fetching);
        let (feeds, failed) = self.fetch_all().await;
        if feeds.is_empty() && !self.countries.is_empty() {
            return Err(ReconcileError::AllFeedsFailed {
                failed: failed.len(),
            });
        }
        let desired = DesiredState::build(self.mode, self.layout, feeds);

        self.set_phase(Phase::Diffing);
        let live = self
            .store
            .snapshot()
            .await
            .map_err(ReconcileError::Snapshot)?;
        let managed: EntrySet = live
            .into_iter()
            .filter(|entry| scope == Scope::Owned || self.is_managed(entry.group))
            .collect();
        let diff = PolicyDiff::between(&managed, desired.entries());
        debug!(
            "Diff: {} live managed entries, {} desired, +{} -{}",
            managed.len(),
            desired.len(),
            diff.to_add.len(),
            diff.to_remove.len()
        );

        Ok(Plan {
            desired,
            diff,
            failed,
        })
    }

    /// Entries of groups outside the configured countries are never touched.
    /// A configured country whose feed failed this pass is still managed, so
    /// its entries are withdrawn rather than left half-stale.
    fn is_managed(&self, group: Group) -> bool {
        match (self.layout, group) {
            (SetLayout::PerCountry, Group::Country(cc)) => self.countries.contains(&cc),
            (SetLayout::Merged, Group::All) => true,
            _ => false,
        }
    }

    /// Fetch and parse every country, at most `max_concurrent` at a time
    async fn fetch_all(&self) -> (Vec<(CountryCode, Vec<Prefix>)>, Vec<FeedFetchError>) {
        let results: Vec<_> = stream::iter(self.countries.iter().copied())
            .map(|country| async move { (country, self.fetch_country(country).await) })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut feeds = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (country, result) in results {
            match result {
                Ok(prefixes) => feeds.push((country, prefixes)),
                Err(source) => {
                    let err = FeedFetchError { country, source };
                    warn!("{}, skipping this pass", err);
                    failed.push(err);
                }
            }
        }
        // buffer_unordered finishes in any order
        feeds.sort_by_key(|(country, _)| *country);
        failed.sort_by_key(|e| e.country);
        (feeds, failed)
    }

    async fn fetch_country(&self, country: CountryCode) -> Result<Vec<Prefix>, FeedError> {
        let body = self.feeds.fetch(country).await?;
        let (prefixes, summary) = parse_feed_with_summary(&body);
        if summary.skipped() > 0 {
            debug!(
                "Feed for {}: skipped {} of {} lines",
                country,
                summary.skipped(),
                summary.lines
            );
        }
        if prefixes.is_empty() {
            return Err(FeedError::Empty);
        }
        debug!("Feed for {}: {} prefixes", country, prefixes.len());
        Ok(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Config};
    use crate::enforcer::{CountsBySet, MemoryStore};
    use crate::fetcher::MockFeedSource;
    use crate::policy::{Action, PolicyEntry};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn cc(s: &str) -> CountryCode {
        s.parse().unwrap()
    }

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn settings(mode: Mode, layout: SetLayout, countries: &[&str]) -> Settings {
        Config {
            mode: Some(mode),
            countries: countries.iter().map(|s| s.to_string()).collect(),
            backend: Backend::Memory,
            layout,
            ..Config::default()
        }
        .validate()
        .unwrap()
    }

    /// Serves fixed feed bodies; countries without a body return HTTP 404
    #[derive(Default)]
    struct StaticFeeds {
        bodies: Mutex<BTreeMap<CountryCode, String>>,
    }

    impl StaticFeeds {
        fn with(feeds: &[(&str, &str)]) -> Arc<Self> {
            let source = Self::default();
            for (country, body) in feeds {
                source.set(country, body);
            }
            Arc::new(source)
        }

        fn set(&self, country: &str, body: &str) {
            self.bodies.lock().insert(cc(country), body.to_string());
        }

        fn remove(&self, country: &str) {
            self.bodies.lock().remove(&cc(country));
        }
    }

    #[async_trait]
    impl FeedSource for StaticFeeds {
        async fn fetch(&self, country: CountryCode) -> Result<String, FeedError> {
            self.bodies
                .lock()
                .get(&country)
                .cloned()
                .ok_or(FeedError::Status(404))
        }
    }

    /// Records every diff before handing it to a memory store
    struct RecordingStore {
        inner: MemoryStore,
        diffs: Mutex<Vec<PolicyDiff>>,
    }

    impl RecordingStore {
        fn new(inner: MemoryStore) -> Arc<Self> {
            Arc::new(Self {
                inner,
                diffs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EnforcementStore for RecordingStore {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn snapshot(&self) -> Result<EntrySet, StoreError> {
            self.inner.snapshot().await
        }

        async fn apply_diff(&self, diff: &PolicyDiff) -> Result<(), StoreError> {
            self.diffs.lock().push(diff.clone());
            self.inner.apply_diff(diff).await
        }

        async fn reset(&self) -> Result<(), StoreError> {
            self.inner.reset().await
        }

        async fn read_counts(&self) -> Result<CountsBySet, StoreError> {
            self.inner.read_counts().await
        }
    }

    fn reconciler(
        settings: &Settings,
        store: Arc<dyn EnforcementStore>,
        feeds: Arc<dyn FeedSource>,
    ) -> Reconciler {
        let hub = Arc::new(ObservabilityHub::new(
            settings.mode.action(),
            settings.countries.iter().copied(),
        ));
        Reconciler::new(settings, store, feeds, hub)
    }

    fn entry(country: &str, prefix: &str, action: Action) -> PolicyEntry {
        PolicyEntry::new(Group::Country(cc(country)), p(prefix), action)
    }

    #[tokio::test]
    async fn test_pass_makes_live_equal_desired() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us", "cn"]);
        let store = Arc::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[
            ("us", "1.2.0.0/16\n3.0.0.0/8\n"),
            ("cn", "# header\n36.0.0.0/8\nnot-a-cidr\n"),
        ]);
        let engine = reconciler(&settings, store.clone(), feeds);

        let report = engine.reconcile().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.added, 3);
        assert_eq!(engine.phase(), Phase::Idle);

        let expected: EntrySet = [
            entry("us", "1.2.0.0/16", Action::Deny),
            entry("us", "3.0.0.0/8", Action::Deny),
            entry("cn", "36.0.0.0/8", Action::Deny),
        ]
        .into();
        assert_eq!(store.entries(), expected);
    }

    #[tokio::test]
    async fn test_second_pass_is_empty_diff() {
        let settings = settings(Mode::Allow, SetLayout::PerCountry, &["fr"]);
        let store = RecordingStore::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("fr", "2.0.0.0/8\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        engine.reconcile().await.unwrap();
        let report = engine.reconcile().await.unwrap();

        assert_eq!(report.added, 0);
        assert_eq!(report.removed, 0);
        // The empty diff never reaches the backend
        assert_eq!(store.diffs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_country_is_isolated() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["aa", "bb", "cc"]);
        let store = Arc::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[
            ("aa", "10.0.0.0/8\n"),
            ("bb", "20.0.0.0/8\n"),
            ("cc", "30.0.0.0/8\n"),
        ]);
        let engine = reconciler(&settings, store.clone(), feeds.clone());
        engine.reconcile().await.unwrap();

        feeds.remove("bb");
        feeds.set("aa", "10.0.0.0/8\n11.0.0.0/8\n");
        let report = engine.reconcile().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].country, cc("bb"));
        let expected: EntrySet = [
            entry("aa", "10.0.0.0/8", Action::Deny),
            entry("aa", "11.0.0.0/8", Action::Deny),
            entry("cc", "30.0.0.0/8", Action::Deny),
        ]
        .into();
        assert_eq!(store.entries(), expected);
    }

    #[tokio::test]
    async fn test_diff_is_minimal() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["aa"]);
        let store = RecordingStore::new(MemoryStore::with_entries([entry(
            "aa",
            "10.0.0.0/8",
            Action::Deny,
        )]));
        let feeds = StaticFeeds::with(&[("aa", "10.0.0.0/8\n11.0.0.0/8\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        engine.reconcile().await.unwrap();

        let diffs = store.diffs.lock();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].to_add, [entry("aa", "11.0.0.0/8", Action::Deny)].into());
        assert!(diffs[0].to_remove.is_empty());
    }

    #[tokio::test]
    async fn test_mode_switch() {
        let store = RecordingStore::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);

        let allow = settings(Mode::Allow, SetLayout::PerCountry, &["us"]);
        reconciler(&allow, store.clone(), feeds.clone())
            .reconcile()
            .await
            .unwrap();

        let deny = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        reconciler(&deny, store.clone(), feeds).reconcile().await.unwrap();

        let diffs = store.diffs.lock();
        assert_eq!(diffs[1].to_remove, [entry("us", "1.2.0.0/16", Action::Allow)].into());
        assert_eq!(diffs[1].to_add, [entry("us", "1.2.0.0/16", Action::Deny)].into());
        assert_eq!(
            store.inner.entries(),
            [entry("us", "1.2.0.0/16", Action::Deny)].into()
        );
    }

    #[tokio::test]
    async fn test_unmanaged_entries_untouched() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let foreign = entry("ru", "5.0.0.0/8", Action::Deny);
        let store = Arc::new(MemoryStore::with_entries([foreign]));
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        engine.reconcile().await.unwrap();
        assert!(store.entries().contains(&foreign));
        assert_eq!(store.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_merged_layout() {
        let settings = settings(Mode::Deny, SetLayout::Merged, &["us", "ca"]);
        let store = Arc::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n"), ("ca", "1.2.0.0/16\n5.0.0.0/8\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        engine.reconcile().await.unwrap();
        let expected: EntrySet = [
            PolicyEntry::new(Group::All, p("1.2.0.0/16"), Action::Deny),
            PolicyEntry::new(Group::All, p("5.0.0.0/8"), Action::Deny),
        ]
        .into();
        assert_eq!(store.entries(), expected);
    }

    #[tokio::test]
    async fn test_partial_apply_still_idle() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let store = Arc::new(MemoryStore::new());
        store.reject_prefix(p("3.0.0.0/8"));
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n3.0.0.0/8\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        let report = engine.reconcile().await.unwrap();
        assert_eq!(report.failed_entries.len(), 1);
        assert_eq!(report.failed_entries[0].entry.prefix, p("3.0.0.0/8"));
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(store.entries(), [entry("us", "1.2.0.0/16", Action::Deny)].into());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_pass() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        let err = engine.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Snapshot(StoreError::Unavailable(_))));
        assert_eq!(engine.phase(), Phase::Failed);

        // Next tick recovers once the backend is back
        store.set_unavailable(false);
        engine.reconcile().await.unwrap();
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_all_feeds_failed_applies_nothing() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us", "de"]);
        let existing = entry("us", "1.2.0.0/16", Action::Deny);
        let store = RecordingStore::new(MemoryStore::with_entries([existing]));
        let engine = reconciler(&settings, store.clone(), StaticFeeds::with(&[]));

        let err = engine.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::AllFeedsFailed { failed: 2 }));
        assert!(store.diffs.lock().is_empty());
        assert_eq!(store.inner.entries(), [existing].into());
    }

    #[tokio::test]
    async fn test_empty_feed_counts_as_failure() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us", "de"]);
        let store = Arc::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n"), ("de", "<html>oops</html>\n")]);
        let engine = reconciler(&settings, store, feeds);

        let report = engine.reconcile().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].source, FeedError::Empty));
    }

    #[tokio::test]
    async fn test_bootstrap_withdraws_leftovers() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let leftover = entry("ru", "5.0.0.0/8", Action::Deny);
        let kept = entry("us", "1.2.0.0/16", Action::Deny);
        let store = RecordingStore::new(MemoryStore::with_entries([leftover, kept]));
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        engine.bootstrap().await.unwrap();
        assert_eq!(store.inner.entries(), [kept].into());

        // Entries that were already right are never withdrawn
        let diffs = store.diffs.lock();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].to_remove, [leftover].into());
        assert!(diffs[0].to_add.is_empty());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_keeps_previous_entries() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let previous = entry("us", "1.2.0.0/16", Action::Deny);
        let store = RecordingStore::new(MemoryStore::with_entries([previous]));
        let mut feeds = MockFeedSource::new();
        feeds
            .expect_fetch()
            .returning(|_| Err(FeedError::Status(503)));
        let engine = reconciler(&settings, store.clone(), Arc::new(feeds));

        let err = engine.bootstrap().await.unwrap_err();
        assert!(matches!(err, ReconcileError::AllFeedsFailed { failed: 1 }));
        assert!(store.diffs.lock().is_empty());
        assert_eq!(store.inner.entries(), [previous].into());
        assert_eq!(engine.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_bootstrap_snapshot_failure() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let engine = reconciler(&settings, store, StaticFeeds::with(&[("us", "1.2.0.0/16\n")]));

        assert!(matches!(
            engine.bootstrap().await,
            Err(ReconcileError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_plan_does_not_apply() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let store = RecordingStore::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);
        let engine = reconciler(&settings, store.clone(), feeds);

        let plan = engine.plan().await.unwrap();
        assert_eq!(plan.diff.to_add.len(), 1);
        assert!(store.diffs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_passes_serialize() {
        let settings = settings(Mode::Deny, SetLayout::PerCountry, &["us"]);
        let store = RecordingStore::new(MemoryStore::new());
        let feeds = StaticFeeds::with(&[("us", "1.2.0.0/16\n")]);
        let engine = Arc::new(reconciler(&settings, store.clone(), feeds));

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reconcile().await.map(|r| r.added) }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reconcile().await.map(|r| r.added) }
        });
        let added = a.await.unwrap().unwrap() + b.await.unwrap().unwrap();

        // The second pass diffs against the first pass's result
        assert_eq!(added, 1);
        assert_eq!(store.diffs.lock().len(), 1);
    }
}
