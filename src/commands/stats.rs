//! Stats command implementation.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use super::load_config;
use crate::cli::GlobalOptions;
use crate::enforcer::{open_persistent_store, SetCounters};
use crate::stats::format_stats;

/// Run the stats command
pub async fn run(json: bool, options: &GlobalOptions) -> Result<()> {
    let config = load_config(options)?;
    let store = open_persistent_store(&config)?;

    let counts = store
        .read_counts()
        .await
        .with_context(|| format!("Failed to read {} counters", store.name()))?;

    if json {
        let by_name: BTreeMap<String, SetCounters> = counts
            .iter()
            .map(|(key, counters)| (key.set_name(), *counters))
            .collect();
        println!("{}", serde_json::to_string_pretty(&by_name)?);
    } else {
        print!("{}", format_stats(store.name(), &counts));
    }
    Ok(())
}
