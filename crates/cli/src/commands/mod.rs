//! Command implementations.

mod info;
mod ride;
mod validate;
mod watch;

pub use info::run_info;
pub use ride::run_ride;
pub use validate::run_validate;
pub use watch::run_watch;

use anyhow::{Context, Result};
use contracts::RideBlueprint;
use std::path::Path;

use crate::error::CliError;

/// Load and validate the blueprint at `path`.
fn load_blueprint(path: &Path) -> Result<RideBlueprint> {
    if !path.exists() {
        return Err(CliError::config_not_found(path).into());
    }
    config_loader::ConfigLoader::load_from_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}
