//! conductor.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::types::CanaryThresholds;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    pub rollout: RolloutConfig,
    /// Defaults for canary thresholds a request leaves unset.
    pub canary: CanaryThresholds,
    pub estimate: EstimateConfig,
    pub probe: ProbeConfig,
    pub logging: LoggingConfig,
}

/// Strategy-local timeouts and pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutConfig {
    #[serde(with = "duration::string")]
    pub rollout_timeout: Duration,
    #[serde(with = "duration::string")]
    pub readiness_timeout: Duration,
    #[serde(with = "duration::string")]
    pub termination_timeout: Duration,
    /// Drain period between blue-green cutover and deleting blue.
    #[serde(with = "duration::string")]
    pub blue_green_grace: Duration,
    /// Share of traffic sent to the canary while it is observed.
    pub canary_traffic_percent: u8,
    #[serde(with = "duration::string")]
    pub canary_sample_interval: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            rollout_timeout: Duration::from_secs(600),
            readiness_timeout: Duration::from_secs(300),
            termination_timeout: Duration::from_secs(120),
            blue_green_grace: Duration::from_secs(30),
            canary_traffic_percent: 10,
            canary_sample_interval: Duration::from_secs(30),
        }
    }
}

/// Constants of the rollout time estimate, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EstimateConfig {
    pub base_secs: u64,
    pub rolling_secs: u64,
    pub blue_green_secs: u64,
    pub canary_secs: u64,
    pub recreate_secs: u64,
    pub per_replica_secs: u64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            rolling_secs: 60,
            blue_green_secs: 120,
            canary_secs: 180,
            recreate_secs: 15,
            per_replica_secs: 10,
        }
    }
}

/// HTTP probe transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Address of an environment; `{name}` is replaced by its name.
    pub address_template: String,
    pub metrics_path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address_template: "{name}:8080".to_string(),
            metrics_path: "/metrics/canary".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ConductorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConductorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
