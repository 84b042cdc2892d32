//! Enforcement store adapters (nftables sets, XDP LPM map, in-memory).
//!
//! Every backend exposes the same contract: a full snapshot of the entries
//! geogate owns, a diff-based apply, a reset, and read-only counters. The
//! reconciliation engine only ever talks to [`EnforcementStore`].

pub mod command;
pub mod listing;
mod memory;
mod nftables;
mod xdp;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use nftables::NftablesStore;
pub use xdp::XdpStore;

use crate::config::{Backend, Config, Settings};
use crate::error::StoreError;
use crate::policy::{EntrySet, Mode, PolicyDiff, SetKey};

/// Counters for one backend set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetCounters {
    pub entries: u64,
    pub packets: u64,
    pub bytes: u64,
}

/// Counters for every set geogate owns.
pub type CountsBySet = BTreeMap<SetKey, SetCounters>;

/// Trait for enforcement backends.
///
/// Implementations serialize their own operations; callers may snapshot or
/// read counters while an apply is in flight.
#[async_trait]
pub trait EnforcementStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Full read of the entries geogate owns
    async fn snapshot(&self) -> Result<EntrySet, StoreError>;

    /// Add `diff.to_add`, then remove `diff.to_remove`.
    ///
    /// Entry-level failures are collected and returned together as
    /// [`StoreError::PartialApply`] after every other entry was attempted.
    async fn apply_diff(&self, diff: &PolicyDiff) -> Result<(), StoreError>;

    /// Remove every entry and rule geogate installed
    async fn reset(&self) -> Result<(), StoreError>;

    /// Entry, packet and byte counters per set
    async fn read_counts(&self) -> Result<CountsBySet, StoreError>;
}

/// Create the configured enforcement store.
///
/// For the XDP backend this loads and attaches the program; the program is
/// detached when the returned store is dropped.
pub fn create_store(settings: &Settings) -> Result<Arc<dyn EnforcementStore>> {
    match settings.backend {
        Backend::Nftables => Ok(Arc::new(NftablesStore::new(
            settings.nftables.clone(),
            settings.mode,
        ))),
        Backend::Xdp => Ok(Arc::new(XdpStore::open(&settings.xdp)?)),
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Open the configured backend from a short-lived command (`stats`,
/// `reset`, `sync`) without loading anything into the kernel.
///
/// The XDP map only lives as long as the process that attached the program,
/// so it can only be reached through `geogate run`.
pub fn open_persistent_store(config: &Config) -> Result<Arc<dyn EnforcementStore>> {
    match config.backend {
        Backend::Nftables => {
            config.nftables.validate()?;
            Ok(Arc::new(NftablesStore::new(
                config.nftables.clone(),
                config.mode.unwrap_or(Mode::Deny),
            )))
        }
        Backend::Xdp => anyhow::bail!(
            "The xdp backend's map is owned by the running `geogate run` process.\n\
             Query its metrics endpoint for statistics; stopping it detaches the filter."
        ),
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Check if running as root (effective UID == 0)
///
/// Attaching XDP programs and editing nftables both need CAP_NET_ADMIN; the
/// UID check covers the common case of running under sudo or systemd.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has CAP_NET_ADMIN (and CAP_BPF for the xdp backend)."
        )
    }
    Ok(())
}
