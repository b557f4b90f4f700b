//! Configuration management.
//!
//! Settings are layered TOML loaded with the `config` crate:
//! `config/default.toml` first, then an optional named profile. Durations
//! are written human-readable (`"5s"`, `"250ms"`).

use crate::core::DeviceKind;
use crate::error::{AppResult, BenchError};
use config::Config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    /// Devices on the bench, keyed by a free-form name used in events and
    /// log lines.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    /// Worker slots in the task pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Boot-time backend switch: simulated controllers for every device.
    #[serde(default)]
    pub simulation: bool,
    /// Base directory for calibration artifacts.
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutSettings {
    /// Reachability probe budget per connect.
    #[serde(with = "humantime_serde", default = "default_connect")]
    pub connect: Duration,
    /// Per-command I/O budget on the instrument link.
    #[serde(with = "humantime_serde", default = "default_io")]
    pub io: Duration,
    /// Grace period for draining in-flight tasks on shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown")]
    pub shutdown: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            io: default_io(),
            shutdown: default_shutdown(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceSettings {
    pub kind: DeviceKind,
    /// Network endpoint, `host:port`.
    pub address: String,
}

fn default_worker_threads() -> usize {
    4
}

fn default_connect() -> Duration {
    Duration::from_secs(5)
}

fn default_io() -> Duration {
    Duration::from_secs(2)
}

fn default_shutdown() -> Duration {
    Duration::from_secs(10)
}

impl Settings {
    /// Loads `config/default.toml` plus the named profile, if given.
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let mut builder =
            Config::builder().add_source(config::File::with_name("config/default"));
        if let Some(name) = config_name {
            builder = builder.add_source(config::File::with_name(&format!("config/{name}")));
        }
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from one explicit file.
    pub fn from_path(path: &std::path::Path) -> AppResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.application.worker_threads == 0 {
            return Err(BenchError::Configuration(
                "application.worker_threads must be at least 1".into(),
            ));
        }
        for (name, device) in &self.devices {
            if device.address.is_empty() {
                return Err(BenchError::Configuration(format!(
                    "device '{name}' has an empty address"
                )));
            }
        }
        Ok(())
    }
}
