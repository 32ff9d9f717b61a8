//! Daemon configuration, loaded from TOML or JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};
use crate::state::DEFAULT_RESERVE_FACTOR;

/// Timeout policy for bulk transfer subprocesses.
///
/// A transfer of `n` GiB is allowed `base_secs + secs_per_gib * n` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    /// Fixed allowance per transfer.
    pub base_secs: u64,
    /// Additional allowance per GiB transferred.
    pub secs_per_gib: u64,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            base_secs: 300,
            secs_per_gib: 60,
        }
    }
}

impl TransferPolicy {
    /// Timeout for a transfer of `size_b` bytes.
    pub fn timeout(&self, size_b: u64) -> Duration {
        let gib = size_b as f64 / (1u64 << 30) as f64;
        let scaled = Duration::try_from_secs_f64(self.secs_per_gib as f64 * gib).unwrap_or(Duration::MAX);
        Duration::from_secs(self.base_secs).saturating_add(scaled)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Worker threads. Zero runs everything serially in the update loop.
    pub num_workers: usize,
    /// How long an idle worker waits on the queue before rechecking its flags.
    pub poll_interval_ms: u64,
    /// Pause between update passes.
    pub update_interval_secs: u64,
    /// Safety multiplier for byte reservations.
    pub reserve_factor: f64,
    /// Search a group's nodes for an unregistered copy before pulling into it.
    pub pull_search: bool,
    /// Bulk transfer timeouts.
    pub transfer: TransferPolicy,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// JSON snapshot used to seed the in-memory data index.
    pub index_snapshot: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval_ms: 5000,
            update_interval_secs: 60,
            reserve_factor: DEFAULT_RESERVE_FACTOR,
            pull_search: true,
            transfer: TransferPolicy::default(),
            log_json: false,
            index_snapshot: None,
        }
    }
}

impl DaemonConfig {
    /// Loads a config file; the format is chosen by extension.
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DaemonConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ArchiveError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ArchiveError::Config(e.to_string()))?
            }
            _ => {
                return Err(ArchiveError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the daemon cannot run with.
    pub fn validate(&self) -> ArchiveResult<()> {
        if !(self.reserve_factor >= 1.0) {
            return Err(ArchiveError::Config(format!(
                "reserve_factor must be at least 1.0, got {}",
                self.reserve_factor
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ArchiveError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Queue poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause between update passes.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}
