//! Reset command implementation.

use anyhow::Result;

use super::load_config;
use crate::cli::GlobalOptions;
use crate::config::Backend;
use crate::enforcer::{check_root, open_persistent_store};
use crate::lock::LockGuard;

/// Run the reset command
pub async fn run(options: &GlobalOptions) -> Result<()> {
    let config = load_config(options)?;
    if config.backend != Backend::Memory {
        check_root()?;
    }
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let store = open_persistent_store(&config)?;
    store.reset().await?;

    println!("[OK] Removed everything geogate installed ({} backend)", store.name());
    Ok(())
}
