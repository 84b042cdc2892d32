//! In-memory enforcement store.
//!
//! Backs `--backend memory` (dry runs without touching the kernel) and the
//! engine tests. Failures can be injected to exercise the error paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use super::{CountsBySet, EnforcementStore};
use crate::error::{FailedMutation, MutationKind, PartialApplyFailure, StoreError};
use crate::policy::{Action, EntrySet, Group, PolicyDiff, PolicyEntry, Prefix};

#[derive(Default)]
struct Inner {
    /// One action per (group, prefix), like a kernel map keyed on the prefix
    entries: BTreeMap<(Group, Prefix), Action>,
    unavailable: bool,
    rejected: BTreeSet<Prefix>,
    applies: usize,
}

/// Enforcement store that keeps entries in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate entries, as if left behind by an earlier run
    pub fn with_entries(entries: impl IntoIterator<Item = PolicyEntry>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for entry in entries {
                inner.entries.insert((entry.group, entry.prefix), entry.action);
            }
        }
        store
    }

    /// Make every operation fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Reject every mutation touching `prefix`
    pub fn reject_prefix(&self, prefix: Prefix) {
        self.inner.lock().rejected.insert(prefix);
    }

    /// Number of `apply_diff` calls that reached the store
    pub fn apply_count(&self) -> usize {
        self.inner.lock().applies
    }

    pub fn entries(&self) -> EntrySet {
        self.inner.lock().entries()
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }

    fn entries(&self) -> EntrySet {
        self.entries
            .iter()
            .map(|((group, prefix), action)| PolicyEntry::new(*group, *prefix, *action))
            .collect()
    }
}

#[async_trait]
impl EnforcementStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn snapshot(&self) -> Result<EntrySet, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.entries())
    }

    async fn apply_diff(&self, diff: &PolicyDiff) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.applies += 1;

        let mut failed = Vec::new();
        for entry in &diff.to_add {
            if inner.rejected.contains(&entry.prefix) {
                failed.push(FailedMutation {
                    entry: *entry,
                    kind: MutationKind::Add,
                    reason: "rejected by memory store".to_string(),
                });
                continue;
            }
            inner.entries.insert((entry.group, entry.prefix), entry.action);
        }

        for entry in &diff.to_remove {
            if inner.rejected.contains(&entry.prefix) {
                failed.push(FailedMutation {
                    entry: *entry,
                    kind: MutationKind::Remove,
                    reason: "rejected by memory store".to_string(),
                });
                continue;
            }
            let key = (entry.group, entry.prefix);
            // An add in the same diff may already have overwritten the action
            if inner.entries.get(&key) == Some(&entry.action) {
                inner.entries.remove(&key);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PartialApplyFailure { failed }.into())
        }
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.entries.clear();
        Ok(())
    }

    async fn read_counts(&self) -> Result<CountsBySet, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;

        let mut counts = CountsBySet::new();
        for entry in inner.entries() {
            counts.entry(entry.set_key()).or_default().entries += 1;
        }
        Ok(counts)
    }
}
