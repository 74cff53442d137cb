//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub partition: PartitionConfig,
    pub defaults: DefaultConditions,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file name, relative to the data directory unless absolute.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleetgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between two evaluations of running rollouts.
    pub tick_interval_secs: u64,
    /// Upper bound of actions created per write transaction when a group activates.
    pub activation_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            activation_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Targets assigned to groups per write transaction.
    pub batch_size: usize,
    /// Failed batches tolerated before a rollout ends in ERROR_CREATING.
    pub max_attempts: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultConditions {
    pub success_threshold: u8,
    pub error_threshold: u8,
}

impl Default for DefaultConditions {
    fn default() -> Self {
        Self {
            success_threshold: 50,
            error_threshold: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,fleetd=debug,fleetgrid=debug".to_string(),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve the database location against a data directory.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            data_dir.join(&self.store.path)
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.defaults.success_threshold > 100 || self.defaults.error_threshold > 100 {
            anyhow::bail!("default thresholds must be within 0..=100");
        }
        if self.partition.batch_size == 0 || self.scheduler.activation_batch_size == 0 {
            anyhow::bail!("batch sizes must be greater than zero");
        }
        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
