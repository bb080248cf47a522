//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::AppConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. Working-directory overrides (optional)
        .add_source(File::with_name("config/local").required(false));

    // 3. Per-user overrides (optional)
    if let Some(home) = dirs::home_dir() {
        let user_config = home.join(".palmlink").join("config.toml");
        builder = builder.add_source(File::from(user_config).required(false));
    }

    let config = builder
        // 4. Environment variables (highest priority), e.g. PALMLINK_TUNNEL__SUBDOMAIN
        .add_source(
            Environment::with_prefix("PALMLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Parse a configuration from the embedded defaults plus one TOML overlay.
#[cfg(test)]
pub fn load_with_overlay(overlay: &str) -> Result<AppConfig> {
    Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::from_str(overlay, FileFormat::Toml))
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
