//! Default configuration values and the maintenance run configuration

use crate::{Result, StrataError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk size of one point (big-endian f64)
pub const DATAPOINT_SIZE: u64 = 8;

/// Largest run of absent points a slice write may pad
pub const MAX_SLICE_GAP: u64 = 80;

/// Default number of concurrent node workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default wait for the run lock (seconds)
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Default run lock location
pub const DEFAULT_LOCK_PATH: &str = "/var/tmp/strata-maint.lock";

/// Maintenance configuration, fixed for the lifetime of a run
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Maximum absent points a write may pad; also the merge gap budget
    pub max_slice_gap: u64,
    /// Bytes per stored point, used as the merge gap factor
    pub point_size: u64,
    /// Concurrent node workers for whole-tree runs
    pub workers: usize,
    /// Run lock file
    pub lock_path: PathBuf,
    /// Seconds to wait for the run lock
    pub lock_timeout_secs: u64,
    /// Leave the node's most recently ending slice out of merges
    pub skip_active_slice: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            max_slice_gap: MAX_SLICE_GAP,
            point_size: DATAPOINT_SIZE,
            workers: DEFAULT_WORKERS,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            skip_active_slice: true,
        }
    }
}

impl MaintenanceConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| match e {
            StrataError::Config(msg) => StrataError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StrataError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.point_size == 0 {
            return Err(StrataError::Config("point_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(StrataError::Config("workers must be positive".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
