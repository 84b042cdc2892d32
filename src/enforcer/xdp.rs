//! XDP backend: a longest-prefix-match map read by a packet filter attached
//! to one interface.
//!
//! The program and map come from an externally compiled object file. Map key
//! is `(prefix_len: u32, addr: u32 network order)`, value is one byte:
//! 1 passes the packet, 0 drops it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aya::maps::lpm_trie::Key;
use aya::maps::{LpmTrie, MapData, MapError};
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{CountsBySet, EnforcementStore};
use crate::config::XdpConfig;
use crate::error::{FailedMutation, MutationKind, PartialApplyFailure, StoreError};
use crate::interfaces::default_interface;
use crate::policy::{Action, EntrySet, Group, PolicyDiff, PolicyEntry, Prefix};

type PrefixMap = LpmTrie<MapData, u32, u8>;

struct Loaded {
    /// Owns the attached program; dropping it detaches the filter
    _ebpf: Ebpf,
    map: PrefixMap,
}

/// XDP backend holding the loaded program and its prefix map
pub struct XdpStore {
    loaded: Mutex<Loaded>,
    interface: String,
}

fn map_key(prefix: &Prefix) -> Key<u32> {
    Key::new(u32::from(prefix.prefix_len()), prefix.addr().to_be())
}

fn key_prefix(key: &Key<u32>) -> Option<Prefix> {
    let len = u8::try_from(key.prefix_len()).ok()?;
    Prefix::new(u32::from_be(key.data()), len)
}

impl XdpStore {
    /// Load the object file, attach the program and take the prefix map.
    pub fn open(config: &XdpConfig) -> Result<Self> {
        let interface = match &config.interface {
            Some(iface) => iface.clone(),
            None => default_interface()
                .context("No interface configured and none could be detected (set xdp.interface)")?,
        };

        let mut ebpf = Ebpf::load_file(&config.object_path)
            .with_context(|| format!("Failed to load XDP object {:?}", config.object_path))?;

        let program: &mut Xdp = ebpf
            .program_mut(&config.program)
            .with_context(|| format!("Program '{}' not found in object", config.program))?
            .try_into()?;
        program
            .load()
            .with_context(|| format!("Failed to load program '{}'", config.program))?;

        let flags = if config.skb_mode {
            XdpFlags::SKB_MODE
        } else {
            XdpFlags::default()
        };
        program.attach(&interface, flags).with_context(|| {
            format!(
                "Failed to attach XDP program to {} (try xdp.skb_mode: true)",
                interface
            )
        })?;
        info!("XDP program '{}' attached to {}", config.program, interface);

        let map = ebpf
            .take_map(&config.map)
            .with_context(|| format!("Map '{}' not found in object", config.map))?;
        let map = PrefixMap::try_from(map)
            .with_context(|| format!("Map '{}' is not an LPM trie of u32 -> u8", config.map))?;

        Ok(Self {
            loaded: Mutex::new(Loaded { _ebpf: ebpf, map }),
            interface,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Loaded>, StoreError> {
        self.loaded
            .lock()
            .map_err(|_| StoreError::Unavailable("XDP map lock poisoned".to_string()))
    }
}

/// Read every key of the map. Keys with values other than 0/1 are skipped.
fn read_entries(map: &PrefixMap) -> Result<EntrySet, StoreError> {
    let mut entries = EntrySet::new();
    for item in map.iter() {
        let (key, value) = item.map_err(|e| StoreError::unavailable("XDP map read", e))?;
        match (key_prefix(&key), Action::from_byte(value)) {
            (Some(prefix), Some(action)) => {
                entries.insert(PolicyEntry::new(Group::All, prefix, action));
            }
            _ => warn!(
                "Ignoring unexpected XDP map entry (len {}, value {})",
                key.prefix_len(),
                value
            ),
        }
    }
    Ok(entries)
}

#[async_trait]
impl EnforcementStore for XdpStore {
    fn name(&self) -> &'static str {
        "xdp"
    }

    async fn snapshot(&self) -> Result<EntrySet, StoreError> {
        let loaded = self.lock()?;
        read_entries(&loaded.map)
    }

    async fn apply_diff(&self, diff: &PolicyDiff) -> Result<(), StoreError> {
        let mut loaded = self.lock()?;
        let mut failed = Vec::new();

        // Insert overwrites in place, so a key changing action is never absent
        let mut written = BTreeSet::new();
        for entry in &diff.to_add {
            match loaded.map.insert(&map_key(&entry.prefix), entry.action.to_byte(), 0) {
                Ok(()) => {
                    written.insert(entry.prefix);
                }
                Err(e) => failed.push(FailedMutation {
                    entry: *entry,
                    kind: MutationKind::Add,
                    reason: e.to_string(),
                }),
            }
        }

        let mut removed = 0usize;
        for entry in &diff.to_remove {
            if written.contains(&entry.prefix) {
                continue;
            }
            match loaded.map.remove(&map_key(&entry.prefix)) {
                Ok(()) | Err(MapError::KeyNotFound) => removed += 1,
                Err(e) => failed.push(FailedMutation {
                    entry: *entry,
                    kind: MutationKind::Remove,
                    reason: e.to_string(),
                }),
            }
        }

        debug!(
            "XDP map on {}: {} written, {} removed, {} failed",
            self.interface,
            written.len(),
            removed,
            failed.len()
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PartialApplyFailure { failed }.into())
        }
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut loaded = self.lock()?;
        let keys: Vec<Key<u32>> = loaded
            .map
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::unavailable("XDP map read", e))?;

        for key in &keys {
            match loaded.map.remove(key) {
                Ok(()) | Err(MapError::KeyNotFound) => {}
                Err(e) => return Err(StoreError::unavailable("XDP map clear", e)),
            }
        }
        info!("Cleared {} entries from XDP map on {}", keys.len(), self.interface);
        Ok(())
    }

    async fn read_counts(&self) -> Result<CountsBySet, StoreError> {
        let loaded = self.lock()?;
        let mut counts = CountsBySet::new();
        for entry in read_entries(&loaded.map)? {
            counts.entry(entry.set_key()).or_default().entries += 1;
        }
        Ok(counts)
    }
}
