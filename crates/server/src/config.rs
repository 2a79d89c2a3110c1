use std::path::{Path, PathBuf};

use anyhow::Result;
use quotaguard_common::AppConfig;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/quotaguard.yaml";

/// Resolved configuration with the path it was read from, if any.
pub struct ResolvedConfig {
    pub config: AppConfig,
    pub config_path: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Load `path`, or the default location when no path is given. A missing
    /// default file means built-in defaults; an explicit path must exist.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with<F>(path: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, config_path) = match path {
            Some(path) => {
                info!(path = path, "loading configuration");
                (AppConfig::load(path)?, Some(PathBuf::from(path)))
            }
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                info!(path = DEFAULT_CONFIG_PATH, "loading configuration");
                (
                    AppConfig::load(DEFAULT_CONFIG_PATH)?,
                    Some(PathBuf::from(DEFAULT_CONFIG_PATH)),
                )
            }
            None => {
                warn!(path = DEFAULT_CONFIG_PATH, "no configuration file, using defaults");
                (AppConfig::default(), None)
            }
        };

        config.apply_overrides(lookup);
        config.validate()?;

        Ok(Self {
            config,
            config_path,
        })
    }
}
