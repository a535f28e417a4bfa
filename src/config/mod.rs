use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use crate::snapshot::config::SnapshotConfig;
pub use crate::subscription::BusConfig;

/// Complete mantle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MantleConfig {
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub rebind: RebindConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

/// Startup and shutdown behavior of the rebind engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebindConfig {
    /// Rebind from the newest valid snapshot on startup
    #[serde(default = "default_true")]
    pub auto_rebind: bool,

    /// Save one last snapshot during teardown
    #[serde(default = "default_true")]
    pub save_on_shutdown: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RebindConfig {
    fn default() -> Self {
        Self {
            auto_rebind: default_true(),
            save_on_shutdown: default_true(),
        }
    }
}

impl MantleConfig {
    /// Override file values from `MANTLE_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("MANTLE_SNAPSHOT_DIR") {
            self.snapshot.directory = dir.into();
        }
        if let Some(minutes) = var("MANTLE_SNAPSHOT_INTERVAL_MINUTES") {
            self.snapshot.interval_minutes = minutes
                .parse()
                .context("MANTLE_SNAPSHOT_INTERVAL_MINUTES must be a whole number")?;
        }
        if let Some(flag) = var("MANTLE_AUTO_REBIND") {
            self.rebind.auto_rebind = flag
                .parse()
                .context("MANTLE_AUTO_REBIND must be true or false")?;
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<MantleConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: MantleConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
