//! # geogate - country-based IPv4 access policy for Linux hosts
//!
//! Downloads per-country CIDR feeds and keeps the kernel's enforcement state
//! (an XDP longest-prefix-match map or nftables named sets) equal to them, in
//! either allow mode (only listed countries get through) or deny mode (listed
//! countries are dropped).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        geogate                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, sync, stats, reset                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml) -> validated Settings                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scheduler (tokio intervals)                                │
//! │    ├── Reconciler: fetch -> desired -> diff -> apply        │
//! │    └── StatisticsReader: counters -> hub                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Fetcher (reqwest + rustls), feed parser (ipnet)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer (EnforcementStore trait)                          │
//! │    ├── NftablesStore (nft -f, named sets + counters)        │
//! │    ├── XdpStore (aya, LPM trie)                             │
//! │    └── MemoryStore (dry runs, tests)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ObservabilityHub -> /metrics, /status (axum)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use geogate::config::Config;
//! use geogate::engine::Reconciler;
//! use geogate::enforcer::create_store;
//! use geogate::fetcher::{FeedSource, HttpFeedSource};
//! use geogate::hub::ObservabilityHub;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Config::load("/etc/geogate/config.yaml")?.validate()?;
//!
//!     let store = create_store(&settings)?;
//!     let feeds: Arc<dyn FeedSource> = Arc::new(HttpFeedSource::new(settings.feed.clone())?);
//!     let hub = Arc::new(ObservabilityHub::new(
//!         settings.mode.action(),
//!         settings.countries.iter().copied(),
//!     ));
//!
//!     let engine = Reconciler::new(&settings, store, feeds, hub);
//!     let report = engine.bootstrap().await?;
//!     println!("{} entries enforced", report.desired);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`engine`] - Reconciliation passes
//! - [`enforcer`] - Enforcement backends (nftables, xdp, memory)
//! - [`feed`] - Feed text parsing
//! - [`fetcher`] - HTTP client for country feeds
//! - [`hub`] - Shared health and counter state, Prometheus rendering
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`policy`] - Prefixes, policy entries, desired state and diffs
//! - [`scheduler`] - Refresh and statistics loops
//! - [`server`] - Metrics endpoint
//! - [`signal`] - Graceful shutdown signal handling
//! - [`stats`] - Counter polling and the `stats` display
//! - [`utils`] - Formatting helpers

pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod enforcer;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod hub;
pub mod interfaces;
pub mod lock;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod signal;
pub mod stats;
pub mod utils;

pub use cli::{Cli, Commands};
pub use config::Config;
