//! Configuration management for geogate.
//!
//! Configuration comes from an optional YAML file overlaid with command-line
//! flags. [`Config::validate`] turns it into immutable [`Settings`]; nothing
//! downstream ever sees an unvalidated configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::{CountryCode, Mode, SetLayout};

pub const DEFAULT_FEED_URL: &str =
    "https://www.ipdeny.com/ipblocks/data/aggregated/{country}-aggregated.zone";
pub const DEFAULT_LOCK_FILE: &str = "/run/geogate.lock";

/// Interval validation (e.g., "30s", "10m", "1h", "1d").
/// Requires ASCII-only input to prevent Unicode-related edge cases.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() || interval.len() < 2 {
        return None;
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let value: u64 = num_part.parse().ok()?;
    let unit = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    let secs = value.checked_mul(unit)?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Main configuration structure, as read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filtering mode (allow, deny). Required, from file or flags.
    pub mode: Option<Mode>,

    /// Country codes to enforce
    pub countries: Vec<String>,

    /// Time between reconciliation passes
    pub refresh_interval: String,

    /// Time between statistics polls
    pub stats_interval: String,

    /// Enforcement backend (nftables, xdp, memory)
    pub backend: Backend,

    /// Set layout (per-country, merged)
    pub layout: SetLayout,

    pub feed: FeedConfig,

    pub nftables: NftablesConfig,

    pub xdp: XdpConfig,

    /// Address for the metrics endpoint (disabled when unset)
    pub metrics_addr: Option<SocketAddr>,

    /// Single-instance lock file
    pub lock_file: PathBuf,

    /// Remove all installed entries when the daemon stops
    pub reset_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: None,
            countries: Vec::new(),
            refresh_interval: "1h".to_string(),
            stats_interval: "10s".to_string(),
            backend: Backend::default(),
            layout: SetLayout::default(),
            feed: FeedConfig::default(),
            nftables: NftablesConfig::default(),
            xdp: XdpConfig::default(),
            metrics_addr: None,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            reset_on_exit: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file (not yet validated)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply the allow/deny flags. Both set is a configuration error.
    pub fn set_mode_flags(&mut self, allow: bool, deny: bool) -> Result<(), ConfigError> {
        match (allow, deny) {
            (true, true) => Err(ConfigError::ConflictingModes),
            (true, false) => {
                self.mode = Some(Mode::Allow);
                Ok(())
            }
            (false, true) => {
                self.mode = Some(Mode::Deny);
                Ok(())
            }
            (false, false) => Ok(()),
        }
    }

    /// Validate configuration values and freeze them into [`Settings`]
    pub fn validate(self) -> Result<Settings, ConfigError> {
        let mode = self.mode.ok_or(ConfigError::MissingMode)?;

        // Duplicates are tolerated, order is irrelevant
        let countries = self
            .countries
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<CountryCode>().map_err(ConfigError::InvalidCountry))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if countries.is_empty() {
            return Err(ConfigError::NoCountries);
        }

        let refresh_interval =
            parse_interval(&self.refresh_interval).ok_or_else(|| ConfigError::InvalidInterval {
                field: "refresh_interval",
                value: self.refresh_interval.clone(),
            })?;
        let stats_interval =
            parse_interval(&self.stats_interval).ok_or_else(|| ConfigError::InvalidInterval {
                field: "stats_interval",
                value: self.stats_interval.clone(),
            })?;

        if self.backend == Backend::Xdp && self.layout == SetLayout::PerCountry {
            return Err(ConfigError::UnsupportedLayout {
                backend: "xdp",
                layout: "per-country",
            });
        }

        let url = &self.feed.url_template;
        if !(url.starts_with("https://") || url.starts_with("http://"))
            || !url.contains("{country}")
        {
            return Err(ConfigError::InvalidFeedUrl(url.clone()));
        }

        self.nftables.validate()?;

        Ok(Settings {
            mode,
            countries,
            refresh_interval,
            stats_interval,
            backend: self.backend,
            layout: self.layout,
            feed: self.feed,
            nftables: self.nftables,
            xdp: self.xdp,
            metrics_addr: self.metrics_addr,
            lock_file: self.lock_file,
            reset_on_exit: self.reset_on_exit,
        })
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub countries: BTreeSet<CountryCode>,
    pub refresh_interval: Duration,
    pub stats_interval: Duration,
    pub backend: Backend,
    pub layout: SetLayout,
    pub feed: FeedConfig,
    pub nftables: NftablesConfig,
    pub xdp: XdpConfig,
    pub metrics_addr: Option<SocketAddr>,
    pub lock_file: PathBuf,
    pub reset_on_exit: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// nftables named sets (default)
    #[default]
    Nftables,
    /// Kernel LPM map consulted by an XDP program
    Xdp,
    /// In-process store, nothing is enforced (dry runs)
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Nftables => "nftables",
            Backend::Xdp => "xdp",
            Backend::Memory => "memory",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nftables" | "nft" => Ok(Backend::Nftables),
            "xdp" => Ok(Backend::Xdp),
            "memory" => Ok(Backend::Memory),
            _ => Err(format!(
                "Invalid backend: {}. Valid values: nftables, xdp, memory",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// URL with a `{country}` placeholder
    pub url_template: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Countries fetched in parallel
    pub max_concurrent: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_FEED_URL.to_string(),
            timeout_secs: 30,
            max_retries: 3,
            max_concurrent: 4,
        }
    }
}

impl FeedConfig {
    pub fn url_for(&self, country: CountryCode) -> String {
        self.url_template.replace("{country}", country.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NftablesConfig {
    /// Path to the nft binary
    pub binary: String,
    /// Table owned by geogate (family ip)
    pub table: String,
    /// Upper bound for a single nft invocation
    pub command_timeout_secs: u64,
    /// Elements per `add element` / `delete element` transaction
    pub chunk_size: usize,
}

impl Default for NftablesConfig {
    fn default() -> Self {
        Self {
            binary: "nft".to_string(),
            table: "geogate".to_string(),
            command_timeout_secs: 30,
            chunk_size: 2048,
        }
    }
}

impl NftablesConfig {
    /// The table name ends up in nft scripts, so it is restricted to a safe
    /// character set
    pub fn validate(&self) -> Result<(), ConfigError> {
        let table = &self.table;
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidTableName(table.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XdpConfig {
    /// Compiled XDP object file
    pub object_path: PathBuf,
    pub program: String,
    pub map: String,
    /// Interface to attach to (auto-detected when unset)
    pub interface: Option<String>,
    /// Use generic (SKB) mode instead of letting the driver decide
    pub skb_mode: bool,
}

impl Default for XdpConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from("xdp_filter.o"),
            program: "ip_filter".to_string(),
            map: "ip_map".to_string(),
            interface: None,
            skb_mode: false,
        }
    }
}
