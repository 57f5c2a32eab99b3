//! Error types for CLI operations.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Not one configured device connected before the timeout
    #[error("No device connected within {timeout_secs}s")]
    NoDevices { timeout_secs: f64 },

    /// Real sensors requested from a build without Bluetooth support
    #[cfg_attr(feature = "ble", allow(dead_code))]
    #[error("Built without Bluetooth support; rerun with --simulate or build with `--features ble`")]
    BleUnavailable,

    /// Viewer gave up reconnecting
    #[error("Gave up on {url} after {attempts} failed connections")]
    RetriesExhausted { url: String, attempts: u32 },
}

impl CliError {
    pub fn config_not_found(path: &Path) -> Self {
        Self::ConfigNotFound {
            path: path.display().to_string(),
        }
    }
}
