use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

/// Environment prefix for overrides, e.g. `LEGSYNC_RETRY__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "LEGSYNC_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration by merging `config/Config.toml` and environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read, parsed or validated.
    pub fn load() -> Result<AppConfig> {
        Self::load_from("config/Config.toml", None)
    }

    /// Loads configuration with a profile overlay (`config/Config.{profile}.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read, parsed or validated.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from("config/Config.toml", Some(profile))
    }

    /// Loads configuration from an explicit base file.
    ///
    /// The profile overlay is looked up next to the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read, parsed or validated.
    pub fn load_from(path: impl AsRef<Path>, profile: Option<&str>) -> Result<AppConfig> {
        let path = path.as_ref();
        let mut figment = Figment::new().merge(Toml::file(path));

        if let Some(profile) = profile {
            let overlay = path.with_file_name(format!("Config.{profile}.toml"));
            figment = figment.merge(Toml::file(overlay));
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }
}
