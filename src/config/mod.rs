//! Loading the service configuration from disk.
//!
//! The types live in [`sizeforge_core::config`]; this module only finds and
//! reads the file.

pub use sizeforge_core::config::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Locations tried in order when no config path is given.
const DEFAULT_PATHS: &[&str] = &[
    "./sizeforge.toml",
    "./config.toml",
    "~/.config/sizeforge/config.toml",
    "/etc/sizeforge/config.toml",
];

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config = Config::from_toml(&content)
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    for warning in config.validate() {
        tracing::warn!("Config: {}", warning);
    }

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    for path_str in DEFAULT_PATHS {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(Config::default())
}
