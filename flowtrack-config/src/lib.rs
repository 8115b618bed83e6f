//! # flowtrack configuration
//!
//! Layered configuration for the flow engine and its surroundings.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `config/flowtrack.yaml`
//! 3. `config/<FLOWTRACK_ENV>.yaml`
//! 4. `FLOWTRACK_*` environment variables, `__` separating nested keys
//!    (`FLOWTRACK_FLOW__MEMCAP=64MiB`)

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod flow;
mod manager;
mod telemetry;
mod timeouts;
mod validation;

pub use error::ConfigError;
pub use flow::FlowSettings;
pub use manager::ManagerSettings;
pub use telemetry::TelemetrySettings;
pub use timeouts::{ProtoTimeoutSettings, TimeoutSettings};

const BASE_FILE: &str = "config/flowtrack.yaml";
const ENV_PREFIX: &str = "FLOWTRACK_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct FlowtrackConfig {
    /// Flow table sizing and memory limits.
    #[validate(nested)]
    pub flow: FlowSettings,

    /// Flow manager cadence and emergency thresholds.
    #[validate(nested)]
    pub manager: ManagerSettings,

    /// Idle timeouts per protocol.
    #[validate(nested)]
    pub timeouts: TimeoutSettings,

    #[validate(nested)]
    pub telemetry: TelemetrySettings,
}

impl FlowtrackConfig {
    /// Loads defaults, the config files present under `config/` and the
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(FlowtrackConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        if let Ok(env) = std::env::var("FLOWTRACK_ENV") {
            let env_file = format!("config/{env}.yaml");
            if Path::new(&env_file).exists() {
                figment = figment.merge(Yaml::file(env_file));
            }
        }

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Loads defaults, one YAML file and the environment.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Self::extract(
            Figment::from(Serialized::defaults(FlowtrackConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}
