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
    let config = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("CLAWGATE_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority)
        // prefix_separator("_") ensures CLAWGATE_WORKER__X works (single _
        // after prefix). Without it, config-rs 0.14 defaults the prefix
        // separator to "__", requiring CLAWGATE__WORKER__X.
        .add_source(
            Environment::with_prefix("CLAWGATE")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_deserialize() {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .build()
            .unwrap();
        let app: AppConfig = config.try_deserialize().unwrap();
        assert_eq!(app.server.port, 8443);
        assert_eq!(app.worker.port, 18789);
        assert!(!app.terminal.allow_full_access);
    }
}
