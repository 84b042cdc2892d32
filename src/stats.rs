//! Statistics reader and the `stats` display.

use chrono::Utc;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::enforcer::{CountsBySet, EnforcementStore, SetCounters};
use crate::error::StoreError;
use crate::hub::ObservabilityHub;
use crate::utils::{format_bytes, format_count};

/// Polls backend counters into the hub. Never mutates the backend.
pub struct StatisticsReader {
    store: Arc<dyn EnforcementStore>,
    hub: Arc<ObservabilityHub>,
}

impl StatisticsReader {
    pub fn new(store: Arc<dyn EnforcementStore>, hub: Arc<ObservabilityHub>) -> Self {
        Self { store, hub }
    }

    /// Read counters once. On failure the hub keeps the previous values.
    pub async fn poll(&self) -> Result<CountsBySet, StoreError> {
        match self.store.read_counts().await {
            Ok(counts) => {
                debug!("Read counters for {} sets", counts.len());
                self.hub.record_counts(counts.clone(), Utc::now());
                Ok(counts)
            }
            Err(e) => {
                warn!("Failed to read {} counters: {}", self.store.name(), e);
                Err(e)
            }
        }
    }
}

/// Format counters as the `stats` table
pub fn format_stats(backend: &str, counts: &CountsBySet) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "══════════════════════════════════════════════════════════════════");
    let _ = writeln!(out, " GEOGATE STATISTICS ({})", backend);
    let _ = writeln!(out, "══════════════════════════════════════════════════════════════════");

    if counts.is_empty() {
        let _ = writeln!(out, " No sets installed");
        let _ = writeln!(out, "══════════════════════════════════════════════════════════════════");
        return out;
    }

    let _ = writeln!(out, " COUNTRY  ACTION       ENTRIES      PACKETS        BYTES");
    let _ = writeln!(out, " ──────── ────── ──────────── ──────────── ────────────");

    let mut total = SetCounters::default();
    for (key, counters) in counts {
        let _ = writeln!(
            out,
            " {:<8} {:<6} {:>12} {:>12} {:>12}",
            key.group.to_string(),
            key.action.as_str(),
            format_count(counters.entries),
            format_count(counters.packets),
            format_bytes(counters.bytes),
        );
        total.entries += counters.entries;
        total.packets += counters.packets;
        total.bytes += counters.bytes;
    }

    let _ = writeln!(out, " ──────── ────── ──────────── ──────────── ────────────");
    let _ = writeln!(
        out,
        " {:<15} {:>12} {:>12} {:>12}",
        "TOTAL",
        format_count(total.entries),
        format_count(total.packets),
        format_bytes(total.bytes),
    );
    let _ = writeln!(out, "══════════════════════════════════════════════════════════════════");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::MemoryStore;
    use crate::policy::{Action, CountryCode, Group, PolicyEntry, SetKey};

    fn us() -> Group {
        Group::Country("us".parse::<CountryCode>().unwrap())
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ObservabilityHub>, StatisticsReader) {
        let store = Arc::new(MemoryStore::with_entries([
            PolicyEntry::new(us(), "1.2.0.0/16".parse().unwrap(), Action::Deny),
            PolicyEntry::new(us(), "3.0.0.0/8".parse().unwrap(), Action::Deny),
        ]));
        let hub = Arc::new(ObservabilityHub::new(Action::Deny, Vec::<CountryCode>::new()));
        let reader = StatisticsReader::new(store.clone(), hub.clone());
        (store, hub, reader)
    }

    #[tokio::test]
    async fn test_poll_records_counts() {
        let (_store, hub, reader) = setup();
        let counts = reader.poll().await.unwrap();
        assert_eq!(counts[&SetKey::new(us(), Action::Deny)].entries, 2);
        assert_eq!(hub.counts(), counts);
    }

    #[tokio::test]
    async fn test_failed_poll_leaves_values_stale() {
        let (store, hub, reader) = setup();
        let first = reader.poll().await.unwrap();

        store.set_unavailable(true);
        assert!(reader.poll().await.is_err());
        assert_eq!(hub.counts(), first);
        assert!(hub
            .render()
            .contains("geogate_entries{country=\"us\",action=\"deny\"} 2"));
    }

    #[test]
    fn test_format_stats() {
        let mut counts = CountsBySet::new();
        counts.insert(
            SetKey::new(us(), Action::Deny),
            SetCounters {
                entries: 1500,
                packets: 20,
                bytes: 2048,
            },
        );
        let out = format_stats("nftables", &counts);
        assert!(out.contains("GEOGATE STATISTICS (nftables)"));
        assert!(out.contains(" us       deny"));
        assert!(out.contains("1.5K"));
        assert!(out.contains("2.0 KB"));
        assert!(out.contains("TOTAL"));
    }

    #[test]
    fn test_format_stats_empty() {
        assert!(format_stats("xdp", &CountsBySet::new()).contains("No sets installed"));
    }
}
