use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bytes per decoded sample (16-bit detector values)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Operating mode of the workstation, which decides how many bags it buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkstationRole {
    /// On-screen resolution operator, sees one bag at a time
    Osr,
    /// Search station, keeps a backlog of bags for manual inspection
    Search,
    Supervisor,
    #[default]
    Generic,
}

impl fmt::Display for WorkstationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkstationRole::Osr => "osr",
            WorkstationRole::Search => "search",
            WorkstationRole::Supervisor => "supervisor",
            WorkstationRole::Generic => "generic",
        };
        write!(f, "{}", name)
    }
}

/// What a worker does with a slice the codec refuses to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Leave the slice zero-filled and keep building the bag
    #[default]
    DropSlice,
    /// Move the whole bag to the error state
    FailBag,
}

/// Bag pool sizes per workstation role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    #[serde(default = "default_osr_pool")]
    pub osr: usize,

    #[serde(default = "default_search_pool")]
    pub search: usize,

    #[serde(default = "default_search_pool")]
    pub supervisor: usize,

    #[serde(default = "default_generic_pool")]
    pub default: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            osr: default_osr_pool(),
            search: default_search_pool(),
            supervisor: default_search_pool(),
            default: default_generic_pool(),
        }
    }
}

impl PoolSizes {
    /// Pool size for a given role
    pub fn for_role(&self, role: WorkstationRole) -> usize {
        match role {
            WorkstationRole::Osr => self.osr,
            WorkstationRole::Search => self.search,
            WorkstationRole::Supervisor => self.supervisor,
            WorkstationRole::Generic => self.default,
        }
    }
}

/// Workstation settings consumed by the ingestion core.
///
/// Loaded from `workstation.yaml` by [`crate::config::ConfigManager`], with
/// `BAGSTREAM__*` environment variables layered on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkstationConfig {
    #[serde(default)]
    pub role: WorkstationRole,

    /// Detector columns per slice
    #[serde(default = "default_slice_width")]
    pub slice_width: usize,

    /// Detector rows per slice
    #[serde(default = "default_slice_height")]
    pub slice_height: usize,

    /// Number of dedicated decompression threads (W)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default)]
    pub pool_sizes: PoolSizes,

    /// Period of the dispatch sweep when no pending-work signal arrives
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    #[serde(default)]
    pub decode_failure_policy: DecodeFailurePolicy,

    /// Buffer size of the bag event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for WorkstationConfig {
    fn default() -> Self {
        Self {
            role: WorkstationRole::default(),
            slice_width: default_slice_width(),
            slice_height: default_slice_height(),
            worker_count: default_worker_count(),
            pool_sizes: PoolSizes::default(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            decode_failure_policy: DecodeFailurePolicy::default(),
            event_capacity: default_event_capacity(),
            debug_mode: false,
        }
    }
}

/// Invalid workstation settings
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_count must be at least 1")]
    NoWorkers,

    #[error("pool size for role {0} must be at least 1")]
    EmptyPool(WorkstationRole),

    #[error("slice resolution {width}x{height} is invalid")]
    InvalidResolution { width: usize, height: usize },

    #[error("event_capacity must be at least 1")]
    NoEventCapacity,
}

impl WorkstationConfig {
    /// Number of bag slots (N) for the configured role
    pub fn pool_size(&self) -> usize {
        self.pool_sizes.for_role(self.role)
    }

    /// Codec destination capacity for one slice
    pub fn slice_bytes(&self) -> usize {
        self.slice_width * self.slice_height * BYTES_PER_SAMPLE
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    /// Reject settings the pool and dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.pool_size() == 0 {
            return Err(ConfigError::EmptyPool(self.role));
        }
        if self.slice_width == 0
            || self.slice_height == 0
            || self
                .slice_width
                .checked_mul(self.slice_height)
                .and_then(|px| px.checked_mul(BYTES_PER_SAMPLE))
                .is_none()
        {
            return Err(ConfigError::InvalidResolution {
                width: self.slice_width,
                height: self.slice_height,
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::NoEventCapacity);
        }
        Ok(())
    }
}

fn default_osr_pool() -> usize {
    3
}

fn default_search_pool() -> usize {
    10
}

fn default_generic_pool() -> usize {
    5
}

fn default_slice_width() -> usize {
    512
}

fn default_slice_height() -> usize {
    512
}

fn default_worker_count() -> usize {
    4
}

fn default_dispatch_interval_ms() -> u64 {
    20
}

fn default_event_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workstation_config_defaults() {
        let config = WorkstationConfig::default();
        assert_eq!(config.role, WorkstationRole::Generic);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.pool_size(), 5);
        assert_eq!(config.slice_bytes(), 512 * 512 * 2);
        assert_eq!(config.decode_failure_policy, DecodeFailurePolicy::DropSlice);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_size_follows_role() {
        let mut config = WorkstationConfig::default();

        config.role = WorkstationRole::Osr;
        assert_eq!(config.pool_size(), 3);

        config.role = WorkstationRole::Search;
        assert_eq!(config.pool_size(), 10);

        config.role = WorkstationRole::Supervisor;
        assert_eq!(config.pool_size(), 10);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = WorkstationConfig::default();
        config.worker_count = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));

        let mut config = WorkstationConfig::default();
        config.role = WorkstationRole::Osr;
        config.pool_sizes.osr = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyPool(WorkstationRole::Osr))
        );

        let mut config = WorkstationConfig::default();
        config.slice_height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidResolution { .. })
        ));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "role: osr\nworker_count: 2\ndecode_failure_policy: fail_bag\n";
        let config: WorkstationConfig = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.role, WorkstationRole::Osr);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.slice_width, 512);
        assert_eq!(config.decode_failure_policy, DecodeFailurePolicy::FailBag);
        assert_eq!(config.pool_size(), 3);
    }
}
