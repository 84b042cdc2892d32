//! CLI argument parsing with clap.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::{Backend, Config};
use crate::error::ConfigError;
use crate::policy::SetLayout;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/geogate/config.yaml";

#[derive(Parser)]
#[command(name = "geogate")]
#[command(author, version, about = "Country-based IPv4 access policy (XDP or nftables)")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub options: GlobalOptions,
}

/// Flags shared by every command. They override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Config file path [default: /etc/geogate/config.yaml if present]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Allow only traffic from the listed countries
    #[arg(long, global = true)]
    pub allow: bool,

    /// Drop traffic from the listed countries
    #[arg(long, global = true)]
    pub deny: bool,

    /// Comma-separated country codes (e.g. us,de,fr)
    #[arg(long, global = true, value_delimiter = ',')]
    pub countries: Option<Vec<String>>,

    /// Feed refresh interval (e.g. 30m, 1h, 1d)
    #[arg(long, global = true)]
    pub refresh_interval: Option<String>,

    /// Statistics poll interval (e.g. 10s)
    #[arg(long, global = true)]
    pub stats_interval: Option<String>,

    /// Enforcement backend (nftables, xdp, memory)
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// Set layout (per-country, merged)
    #[arg(long, global = true)]
    pub layout: Option<SetLayout>,

    /// Interface for the XDP program
    #[arg(long, global = true)]
    pub iface: Option<String>,

    /// Address for the metrics endpoint (e.g. 127.0.0.1:9100)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalOptions {
    /// Overlay the flags on a loaded config
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        config.set_mode_flags(self.allow, self.deny)?;
        if let Some(ref countries) = self.countries {
            config.countries = countries.clone();
        }
        if let Some(ref interval) = self.refresh_interval {
            config.refresh_interval = interval.clone();
        }
        if let Some(ref interval) = self.stats_interval {
            config.stats_interval = interval.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(layout) = self.layout {
            config.layout = layout;
        }
        if let Some(ref iface) = self.iface {
            config.xdp.interface = Some(iface.clone());
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
        Ok(())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon: initial sync, then periodic refresh and statistics
    Run,

    /// Run a single reconciliation pass
    Sync {
        /// Fetch and diff but don't touch the backend
        #[arg(long)]
        dry_run: bool,
    },

    /// Show per-set entry, packet and byte counters
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove every set, rule and map entry geogate installed
    Reset,

    /// Show version
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Mode;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_run_with_flags() {
        let cli = parse(&[
            "geogate",
            "run",
            "--deny",
            "--countries",
            "us,cn",
            "--backend",
            "xdp",
            "--layout",
            "merged",
            "--iface",
            "eth0",
        ]);
        assert!(matches!(cli.command, Commands::Run));
        assert!(cli.options.deny);
        assert_eq!(
            cli.options.countries,
            Some(vec!["us".to_string(), "cn".to_string()])
        );
        assert_eq!(cli.options.backend, Some(Backend::Xdp));
        assert_eq!(cli.options.layout, Some(SetLayout::Merged));
    }

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = parse(&["geogate", "-v", "--allow", "sync", "--dry-run"]);
        assert!(cli.options.verbose);
        assert!(matches!(cli.command, Commands::Sync { dry_run: true }));
    }

    #[test]
    fn test_invalid_backend_rejected() {
        assert!(Cli::try_parse_from(["geogate", "run", "--backend", "iptables"]).is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let cli = parse(&[
            "geogate",
            "run",
            "--allow",
            "--countries",
            "fr",
            "--refresh-interval",
            "30m",
            "--metrics-addr",
            "127.0.0.1:9100",
        ]);
        let mut config = Config {
            mode: Some(Mode::Deny),
            countries: vec!["us".to_string()],
            ..Config::default()
        };
        cli.options.apply(&mut config).unwrap();

        assert_eq!(config.mode, Some(Mode::Allow));
        assert_eq!(config.countries, vec!["fr".to_string()]);
        assert_eq!(config.refresh_interval, "30m");
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_apply_conflicting_modes() {
        let cli = parse(&["geogate", "run", "--allow", "--deny"]);
        let err = cli.options.apply(&mut Config::default()).unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingModes));
    }
}
