//! Observability hub: the single owner of everything geogate reports.
//!
//! Created once per process and shared by the reconciliation engine (pass
//! results), the statistics reader (backend counters) and the metrics
//! endpoint (rendering).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::enforcer::{CountsBySet, SetCounters};
use crate::policy::{Action, CountryCode, SetKey};

/// Per-country state as of the last reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountryStatus {
    /// Time of the last pass that installed this country's feed
    pub last_update: Option<DateTime<Utc>>,
    /// Whether the country's entries are live
    pub enforced: bool,
}

/// Outcome of one pass as seen by the hub
#[derive(Debug, Clone, Default)]
pub struct PassRecord {
    pub fetched: BTreeSet<CountryCode>,
    pub failed: BTreeSet<CountryCode>,
    pub failed_entries: usize,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct HubState {
    counts: CountsBySet,
    counts_read_at: Option<DateTime<Utc>>,
    countries: BTreeMap<CountryCode, CountryStatus>,
    passes: u64,
    failures: u64,
    failed_entries: u64,
}

/// Serializable copy of the hub state
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub action: Action,
    pub counts: BTreeMap<String, SetCounters>,
    pub counts_read_at: Option<DateTime<Utc>>,
    pub countries: BTreeMap<CountryCode, CountryStatus>,
    pub passes: u64,
    pub failures: u64,
    pub failed_entries: u64,
}

pub struct ObservabilityHub {
    action: Action,
    state: RwLock<HubState>,
}

impl ObservabilityHub {
    pub fn new(action: Action, countries: impl IntoIterator<Item = CountryCode>) -> Self {
        let state = HubState {
            countries: countries
                .into_iter()
                .map(|cc| (cc, CountryStatus::default()))
                .collect(),
            ..HubState::default()
        };
        Self {
            action,
            state: RwLock::new(state),
        }
    }

    /// Replace the backend counters after a successful read
    pub fn record_counts(&self, counts: CountsBySet, at: DateTime<Utc>) {
        let mut state = self.state.write();
        state.counts = counts;
        state.counts_read_at = Some(at);
    }

    /// Record a pass that reached the backend
    pub fn record_pass(&self, record: &PassRecord) {
        let mut state = self.state.write();
        state.passes += 1;
        state.failed_entries += record.failed_entries as u64;
        for cc in &record.fetched {
            let status = state.countries.entry(*cc).or_default();
            status.last_update = Some(record.finished_at);
            status.enforced = true;
        }
        for cc in &record.failed {
            state.countries.entry(*cc).or_default().enforced = false;
        }
    }

    /// Record a pass that failed before or while applying
    pub fn record_failure(&self) {
        let mut state = self.state.write();
        state.passes += 1;
        state.failures += 1;
    }

    pub fn counts(&self) -> CountsBySet {
        self.state.read().counts.clone()
    }

    pub fn country_status(&self, country: CountryCode) -> Option<CountryStatus> {
        self.state.read().countries.get(&country).copied()
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let state = self.state.read();
        HubSnapshot {
            action: self.action,
            counts: state
                .counts
                .iter()
                .map(|(key, counters)| (key.set_name(), *counters))
                .collect(),
            counts_read_at: state.counts_read_at,
            countries: state.countries.clone(),
            passes: state.passes,
            failures: state.failures,
            failed_entries: state.failed_entries,
        }
    }

    /// Render Prometheus text exposition format
    pub fn render(&self) -> String {
        let state = self.state.read();
        let mut output = String::with_capacity(2048);

        let labels = |key: &SetKey| -> [(&'static str, String); 2] {
            [
                ("country", key.group.to_string()),
                ("action", key.action.to_string()),
            ]
        };

        write_metric_header(&mut output, "geogate_packets_total", "Packets matched per set", "counter");
        for (key, counters) in &state.counts {
            write_metric_value(&mut output, "geogate_packets_total", &labels(key), counters.packets);
        }

        write_metric_header(&mut output, "geogate_bytes_total", "Bytes matched per set", "counter");
        for (key, counters) in &state.counts {
            write_metric_value(&mut output, "geogate_bytes_total", &labels(key), counters.bytes);
        }

        write_metric_header(&mut output, "geogate_entries", "Prefixes installed per set", "gauge");
        for (key, counters) in &state.counts {
            write_metric_value(&mut output, "geogate_entries", &labels(key), counters.entries);
        }

        write_metric_header(
            &mut output,
            "geogate_last_update_timestamp_seconds",
            "Unix time of the last pass that installed the country's feed",
            "gauge",
        );
        for (cc, status) in &state.countries {
            if let Some(at) = status.last_update {
                write_metric_value(
                    &mut output,
                    "geogate_last_update_timestamp_seconds",
                    &[("country", cc.to_string())],
                    at.timestamp().max(0) as u64,
                );
            }
        }

        write_metric_header(
            &mut output,
            "geogate_country_enforced",
            "Whether the country is currently allowed or blocked (1) or not enforced (0)",
            "gauge",
        );
        for (cc, status) in &state.countries {
            write_metric_value(
                &mut output,
                "geogate_country_enforced",
                &[("country", cc.to_string()), ("action", self.action.to_string())],
                u64::from(status.enforced),
            );
        }

        write_metric_header(&mut output, "geogate_reconcile_passes_total", "Reconciliation passes run", "counter");
        write_metric_value(&mut output, "geogate_reconcile_passes_total", &[], state.passes);

        write_metric_header(
            &mut output,
            "geogate_reconcile_failures_total",
            "Reconciliation passes that failed",
            "counter",
        );
        write_metric_value(&mut output, "geogate_reconcile_failures_total", &[], state.failures);

        write_metric_header(
            &mut output,
            "geogate_apply_failed_entries_total",
            "Entries the backend rejected",
            "counter",
        );
        write_metric_value(&mut output, "geogate_apply_failed_entries_total", &[], state.failed_entries);

        output
    }
}

fn write_metric_header(output: &mut String, name: &str, help: &str, metric_type: &str) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, metric_type);
}

fn write_metric_value(output: &mut String, name: &str, labels: &[(&str, String)], value: u64) {
    if labels.is_empty() {
        let _ = writeln!(output, "{} {}", name, value);
        return;
    }
    let label_str = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(output, "{}{{{}}} {}", name, label_str, value);
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
