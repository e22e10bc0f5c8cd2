use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use crate::options::{TarpitOptions, TarpitOptionsUpdate};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub tarpit: TarpitOptionsUpdate,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Status API address, e.g. "127.0.0.1:8054". Disabled when unset.
    pub listen: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file. A relative `response_file` is
    /// taken relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let (Some(file), Some(dir)) = (&config.tarpit.response_file, path.parent()) {
            if file.is_relative() {
                config.tarpit.response_file = Some(dir.join(file));
            }
        }

        Ok(config)
    }

    /// Defaults with the `[tarpit]` section applied and validated.
    pub fn tarpit_options(&self) -> Result<TarpitOptions> {
        let options = self
            .tarpit
            .apply_to(&TarpitOptions::default())
            .context("Invalid [tarpit] section")?;
        options.validate().context("Invalid [tarpit] section")?;
        Ok(options)
    }
}
