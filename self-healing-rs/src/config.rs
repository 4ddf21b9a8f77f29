//! Layered configuration: defaults, then an optional file, then
//! `SELF_HEALING_*` environment variables (`__` separates nested keys, e.g.
//! `SELF_HEALING_RECOVERY__MAX_ATTEMPTS=5`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::CaptureConfig;
use crate::logging::LoggingConfig;
use crate::monitor::HealthConfig;
use crate::recovery::RecoveryConfig;
use crate::store::StoreConfig;
use crate::types::Result;

pub const ENV_PREFIX: &str = "SELF_HEALING";

/// Configuration for the whole pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealingConfig {
    pub store: StoreConfig,
    pub capture: CaptureConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

impl SelfHealingConfig {
    /// Loads `.env`, then the optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = Self::try_from(builder.build()?)?;
        Ok(config)
    }
}

impl TryFrom<config::Config> for SelfHealingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}
