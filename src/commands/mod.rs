//! CLI command implementations.

pub mod reset;
pub mod run;
pub mod stats;
pub mod sync;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use crate::cli::{GlobalOptions, DEFAULT_CONFIG_PATH};
use crate::config::{Config, Settings};

/// Load the config file (explicit path, or the default one if present) and
/// overlay the command-line flags.
pub fn load_config(options: &GlobalOptions) -> Result<Config> {
    let mut config = match &options.config {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)?,
        None => {
            debug!("No config file, using defaults and flags");
            Config::default()
        }
    };
    options.apply(&mut config)?;
    Ok(config)
}

/// [`load_config`], then validate into immutable settings
pub fn load_settings(options: &GlobalOptions) -> Result<Settings> {
    load_config(options)?
        .validate()
        .context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::policy::Mode;
    use std::io::Write;

    #[test]
    fn test_load_settings_from_flags_only() {
        let options = GlobalOptions {
            config: Some("/nonexistent/geogate.yaml".into()),
            ..GlobalOptions::default()
        };
        assert!(load_config(&options).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend: memory").unwrap();
        let options = GlobalOptions {
            config: Some(file.path().to_path_buf()),
            deny: true,
            countries: Some(vec!["us".to_string(), "US".to_string()]),
            ..GlobalOptions::default()
        };
        let settings = load_settings(&options).unwrap();
        assert_eq!(settings.mode, Mode::Deny);
        assert_eq!(settings.backend, Backend::Memory);
        assert_eq!(settings.countries.len(), 1);
    }

    #[test]
    fn test_load_settings_conflicting_modes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "countries: [us]").unwrap();
        let options = GlobalOptions {
            config: Some(file.path().to_path_buf()),
            allow: true,
            deny: true,
            ..GlobalOptions::default()
        };
        let err = load_settings(&options).unwrap_err();
        assert!(err.to_string().contains("both allow and deny"));
    }

    #[test]
    fn test_load_settings_missing_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "countries: [us]").unwrap();
        let options = GlobalOptions {
            config: Some(file.path().to_path_buf()),
            ..GlobalOptions::default()
        };
        let err = load_settings(&options).unwrap_err();
        assert!(format!("{:#}", err).contains("either allow or deny"));
    }
}
