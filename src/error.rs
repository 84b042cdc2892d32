//! Error types for geogate.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::policy::{CountryCode, PolicyEntry};

/// Invalid or contradictory configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot use both allow and deny modes")]
    ConflictingModes,

    #[error("Must specify either allow or deny mode")]
    MissingMode,

    #[error("Must specify at least one country")]
    NoCountries,

    #[error("{0}")]
    InvalidCountry(String),

    #[error("Invalid {field} '{value}'. Use format like '30s', '10m', '1h', '1d'")]
    InvalidInterval { field: &'static str, value: String },

    #[error("The {backend} backend does not support the {layout} layout")]
    UnsupportedLayout {
        backend: &'static str,
        layout: &'static str,
    },

    #[error("Invalid feed URL template '{0}': must use http(s) and contain {{country}}")]
    InvalidFeedUrl(String),

    #[error("Invalid nftables table name '{0}'")]
    InvalidTableName(String),

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Failure to obtain one country's feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("feed contained no valid IPv4 prefixes")]
    Empty,
}

/// A per-country feed failure. The country is skipped for this pass.
#[derive(Error, Debug)]
#[error("feed for '{country}' unavailable: {source}")]
pub struct FeedFetchError {
    pub country: CountryCode,
    #[source]
    pub source: FeedError,
}

/// Which half of a diff a mutation belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Remove,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutationKind::Add => "add",
            MutationKind::Remove => "remove",
        })
    }
}

/// A single entry the backend refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMutation {
    pub entry: PolicyEntry,
    pub kind: MutationKind,
    pub reason: String,
}

impl fmt::Display for FailedMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.entry, self.reason)
    }
}

/// Some entries of an otherwise applied diff were rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} entries failed to apply", .failed.len())]
pub struct PartialApplyFailure {
    pub failed: Vec<FailedMutation>,
}

/// Errors returned by an enforcement store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error(transparent)]
    PartialApply(#[from] PartialApplyFailure),
}

impl StoreError {
    pub fn unavailable(context: impl fmt::Display, cause: impl fmt::Display) -> Self {
        StoreError::Unavailable(format!("{}: {}", context, cause))
    }
}

/// Why a reconciliation pass failed outright.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("No feed could be fetched ({failed} countries failed)")]
    AllFeedsFailed { failed: usize },

    #[error("Snapshot failed: {0}")]
    Snapshot(#[source] StoreError),

    #[error("Apply failed: {0}")]
    Apply(#[source] StoreError),
}
