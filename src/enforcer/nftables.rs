//! nftables backend: one named interval set per (group, action).
//!
//! Layout of the managed table (`ip geogate` by default):
//!
//! ```text
//! table ip geogate {
//!     counter deny_us { ... }
//!     set deny_us { type ipv4_addr; flags interval; elements = { ... } }
//!     chain input {              # base chain, rewritten on every apply
//!         type filter hook input priority -1; policy accept;
//!         jump geo_sets
//!     }
//!     chain geo_sets {           # one rule per set
//!         ip saddr @deny_us counter name "deny_us" drop
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::command::{args_to_strings, CommandRunner, SystemRunner};
use super::listing::{parse_table_listing, TableListing};
use super::{CountsBySet, EnforcementStore, SetCounters};
use crate::config::NftablesConfig;
use crate::error::{FailedMutation, MutationKind, PartialApplyFailure, StoreError};
use crate::policy::{Action, EntrySet, Mode, PolicyDiff, PolicyEntry, SetKey};

const BASE_CHAIN: &str = "input";
const SETS_CHAIN: &str = "geo_sets";

enum ScriptError {
    /// nft could not be run at all
    Unavailable(StoreError),
    /// nft ran and rejected the script
    Rejected(String),
}

/// nftables backend
pub struct NftablesStore<R: CommandRunner = SystemRunner> {
    runner: R,
    config: NftablesConfig,
    mode: Mode,
    /// Serializes nft invocations issued by this process
    exec_lock: Mutex<()>,
}

impl NftablesStore<SystemRunner> {
    pub fn new(config: NftablesConfig, mode: Mode) -> Self {
        let runner = SystemRunner::new(Duration::from_secs(config.command_timeout_secs));
        Self::with_runner(runner, config, mode)
    }
}

impl<R: CommandRunner> NftablesStore<R> {
    pub fn with_runner(runner: R, config: NftablesConfig, mode: Mode) -> Self {
        Self {
            runner,
            config,
            mode,
            exec_lock: Mutex::new(()),
        }
    }

    fn table(&self) -> &str {
        &self.config.table
    }

    /// Read the managed table. `None` when it does not exist yet.
    async fn list_table(&self) -> Result<Option<TableListing>, StoreError> {
        let args = args_to_strings(&["list", "table", "ip", self.table()]);
        let output = {
            let _guard = self.exec_lock.lock().await;
            self.runner.run(&self.config.binary, &args).await
        }
        .map_err(|e| StoreError::unavailable("nft list table", e))?;

        if output.success {
            Ok(Some(parse_table_listing(&output.stdout)))
        } else if output.stderr.contains("No such file or directory") {
            Ok(None)
        } else {
            Err(StoreError::unavailable("nft list table", output.stderr.trim()))
        }
    }

    /// Execute an nft script as one transaction
    async fn exec_script(&self, script: &str) -> Result<(), ScriptError> {
        debug!("Executing nft script:\n{}", script);
        let args = args_to_strings(&["-f", "-"]);
        let output = {
            let _guard = self.exec_lock.lock().await;
            self.runner
                .run_with_stdin(&self.config.binary, &args, script)
                .await
        }
        .map_err(|e| ScriptError::Unavailable(StoreError::unavailable("nft -f", e)))?;

        if output.success {
            Ok(())
        } else {
            Err(ScriptError::Rejected(output.stderr.trim().to_string()))
        }
    }

    /// Structural script: table, chains, the given sets with their counters,
    /// the base chain for the current mode and one rule per kept set.
    /// Sets in `remove` are deleted after their rules are gone.
    ///
    /// The whole script is one transaction, so rewriting the chains never
    /// leaves a window without rules.
    fn generate_structure_script(
        &self,
        keep: &BTreeSet<SetKey>,
        remove: &BTreeSet<SetKey>,
    ) -> String {
        let t = self.table();
        let mut script = String::new();

        script.push_str(&format!("add table ip {}\n", t));
        script.push_str(&format!(
            "add chain ip {} {} {{ type filter hook input priority -1; policy accept; }}\n",
            t, BASE_CHAIN
        ));
        script.push_str(&format!("add chain ip {} {}\n", t, SETS_CHAIN));

        for key in keep {
            let name = key.set_name();
            script.push_str(&format!(
                "add set ip {} {} {{ type ipv4_addr; flags interval; }}\n",
                t, name
            ));
            script.push_str(&format!("add counter ip {} {}\n", t, name));
        }

        script.push_str(&format!("flush chain ip {} {}\n", t, BASE_CHAIN));
        if self.mode == Mode::Allow {
            script.push_str(&format!("add rule ip {} {} iif \"lo\" accept\n", t, BASE_CHAIN));
            script.push_str(&format!(
                "add rule ip {} {} ct state established,related accept\n",
                t, BASE_CHAIN
            ));
        }
        script.push_str(&format!("add rule ip {} {} jump {}\n", t, BASE_CHAIN, SETS_CHAIN));
        if self.mode == Mode::Allow {
            script.push_str(&format!("add rule ip {} {} counter drop\n", t, BASE_CHAIN));
        }

        script.push_str(&format!("flush chain ip {} {}\n", t, SETS_CHAIN));
        // Sets for the current mode first, so a stale set from the other
        // mode can never shadow them while it drains
        let mode_action = self.mode.action();
        let mut ordered: Vec<&SetKey> = keep.iter().collect();
        ordered.sort_by_key(|key| (key.action != mode_action, **key));
        for key in ordered {
            let name = key.set_name();
            let verdict = match key.action {
                Action::Allow => "accept",
                Action::Deny => "drop",
            };
            script.push_str(&format!(
                "add rule ip {} {} ip saddr @{} counter name \"{}\" {}\n",
                t, SETS_CHAIN, name, name, verdict
            ));
        }

        for key in remove {
            let name = key.set_name();
            script.push_str(&format!("delete set ip {} {}\n", t, name));
            script.push_str(&format!("delete counter ip {} {}\n", t, name));
        }

        script
    }

    /// `add element` / `delete element` for a batch of entries of one set
    fn generate_element_script(&self, kind: MutationKind, set: &SetKey, entries: &[PolicyEntry]) -> String {
        let verb = match kind {
            MutationKind::Add => "add",
            MutationKind::Remove => "delete",
        };
        let elements: Vec<String> = entries.iter().map(|e| e.prefix.to_string()).collect();
        format!(
            "{} element ip {} {} {{ {} }}\n",
            verb,
            self.table(),
            set.set_name(),
            elements.join(", ")
        )
    }

    /// Generate the script that removes the whole table
    fn generate_remove_script(&self) -> String {
        format!("delete table ip {}\n", self.table())
    }

    /// Apply one half of a diff, set by set and chunk by chunk. A rejected
    /// chunk is retried one element at a time to isolate the bad entries.
    /// Returns the entries that were applied.
    async fn apply_elements(
        &self,
        kind: MutationKind,
        entries: &EntrySet,
        failed: &mut Vec<FailedMutation>,
    ) -> Result<Vec<PolicyEntry>, StoreError> {
        let mut by_set: BTreeMap<SetKey, Vec<PolicyEntry>> = BTreeMap::new();
        for entry in entries {
            by_set.entry(entry.set_key()).or_default().push(*entry);
        }

        let mut applied = Vec::with_capacity(entries.len());
        let chunk_size = self.config.chunk_size.max(1);

        for (set, set_entries) in &by_set {
            for chunk in set_entries.chunks(chunk_size) {
                let script = self.generate_element_script(kind, set, chunk);
                match self.exec_script(&script).await {
                    Ok(()) => applied.extend_from_slice(chunk),
                    Err(ScriptError::Unavailable(e)) => return Err(e),
                    Err(ScriptError::Rejected(reason)) if chunk.len() == 1 => {
                        failed.push(FailedMutation {
                            entry: chunk[0],
                            kind,
                            reason,
                        });
                    }
                    Err(ScriptError::Rejected(reason)) => {
                        debug!(
                            "nft rejected {} chunk for {} ({}), retrying per element",
                            kind, set, reason
                        );
                        for entry in chunk {
                            let script = self.generate_element_script(kind, set, std::slice::from_ref(entry));
                            match self.exec_script(&script).await {
                                Ok(()) => applied.push(*entry),
                                Err(ScriptError::Unavailable(e)) => return Err(e),
                                Err(ScriptError::Rejected(reason)) => failed.push(FailedMutation {
                                    entry: *entry,
                                    kind,
                                    reason,
                                }),
                            }
                        }
                    }
                }
            }
        }

        Ok(applied)
    }
}

/// Entries geogate owns in a listing. Sets with foreign names are ignored.
fn listing_entries(listing: &TableListing) -> EntrySet {
    listing
        .sets
        .iter()
        .filter_map(|(name, prefixes)| SetKey::from_set_name(name).map(|key| (key, prefixes)))
        .flat_map(|(key, prefixes)| {
            prefixes
                .iter()
                .map(move |prefix| PolicyEntry::new(key.group, *prefix, key.action))
        })
        .collect()
}

#[async_trait]
impl<R: CommandRunner> EnforcementStore for NftablesStore<R> {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn snapshot(&self) -> Result<EntrySet, StoreError> {
        Ok(self
            .list_table()
            .await?
            .map(|listing| listing_entries(&listing))
            .unwrap_or_default())
    }

    async fn apply_diff(&self, diff: &PolicyDiff) -> Result<(), StoreError> {
        if diff.is_empty() {
            return Ok(());
        }

        // Element counts per set before the apply
        let mut sizes: BTreeMap<SetKey, usize> = BTreeMap::new();
        if let Some(listing) = self.list_table().await? {
            for (name, prefixes) in &listing.sets {
                if let Some(key) = SetKey::from_set_name(name) {
                    sizes.insert(key, prefixes.len());
                }
            }
        }

        let mut keep: BTreeSet<SetKey> = sizes.keys().copied().collect();
        keep.extend(diff.touched_sets());
        match self.exec_script(&self.generate_structure_script(&keep, &BTreeSet::new())).await {
            Ok(()) => {}
            Err(ScriptError::Unavailable(e)) => return Err(e),
            Err(ScriptError::Rejected(reason)) => {
                return Err(StoreError::unavailable("nft structure update", reason))
            }
        }

        let mut failed = Vec::new();
        // Additions before removals: an entry moving between sets is never
        // absent from both
        let added = self.apply_elements(MutationKind::Add, &diff.to_add, &mut failed).await?;
        let removed = self
            .apply_elements(MutationKind::Remove, &diff.to_remove, &mut failed)
            .await?;

        for entry in &added {
            *sizes.entry(entry.set_key()).or_default() += 1;
        }
        for entry in &removed {
            if let Some(size) = sizes.get_mut(&entry.set_key()) {
                *size = size.saturating_sub(1);
            }
        }

        // Drop sets this apply drained
        let emptied: BTreeSet<SetKey> = sizes
            .iter()
            .filter(|(key, size)| **size == 0 && diff.to_remove.iter().any(|e| e.set_key() == **key))
            .map(|(key, _)| *key)
            .collect();
        if !emptied.is_empty() {
            let remaining: BTreeSet<SetKey> = keep.difference(&emptied).copied().collect();
            let script = self.generate_structure_script(&remaining, &emptied);
            match self.exec_script(&script).await {
                Ok(()) => debug!("Removed {} drained sets", emptied.len()),
                Err(ScriptError::Unavailable(e)) => return Err(e),
                // Leftover empty sets match nothing
                Err(ScriptError::Rejected(reason)) => {
                    warn!("Failed to remove drained nftables sets: {}", reason)
                }
            }
        }

        info!(
            "Applied nftables diff: +{} -{} ({} failed)",
            added.len(),
            removed.len(),
            failed.len()
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PartialApplyFailure { failed }.into())
        }
    }

    async fn reset(&self) -> Result<(), StoreError> {
        if self.list_table().await?.is_none() {
            return Ok(());
        }
        match self.exec_script(&self.generate_remove_script()).await {
            Ok(()) => {
                info!("Removed nftables table ip {}", self.table());
                Ok(())
            }
            Err(ScriptError::Unavailable(e)) => Err(e),
            Err(ScriptError::Rejected(reason)) => Err(StoreError::unavailable("nft delete table", reason)),
        }
    }

    async fn read_counts(&self) -> Result<CountsBySet, StoreError> {
        let Some(listing) = self.list_table().await? else {
            return Ok(CountsBySet::new());
        };

        let mut counts = CountsBySet::new();
        for (name, prefixes) in &listing.sets {
            let Some(key) = SetKey::from_set_name(name) else {
                continue;
            };
            let (packets, bytes) = listing.counters.get(name).copied().unwrap_or_default();
            counts.insert(
                key,
                SetCounters {
                    entries: prefixes.len() as u64,
                    packets,
                    bytes,
                },
            );
        }
        Ok(counts)
    }
}
