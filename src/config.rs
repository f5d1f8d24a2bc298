//! Already-parsed configuration for one cache target (spec §6: the CLI
//! surface, minus the dm-arg parsing itself, which is out of scope).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum cached-device block size, in 512-byte sectors (spec §6: "must
/// be a power of two and >= 8 sectors").
pub const MIN_BLOCK_SIZE_SECTORS: u64 = 8;

/// Default writeback deferral before a dirty block is flushed unprompted
/// (spec §4.6).
pub const DEFAULT_WRITEBACK_TICK: Duration = Duration::from_secs(3);

/// Configuration for one `cachemetad`-backed cache target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTargetConfig {
    pub cached_dev: PathBuf,
    pub data_dev: PathBuf,
    pub metadata_dev: PathBuf,
    /// Cached-device block size, in 512-byte sectors.
    pub data_block_size_sectors: u64,
    /// Warm-set capacity for the L0 block cache, in metadata blocks.
    pub metadata_cache_capacity: usize,
    #[serde(with = "duration_secs")]
    pub writeback_tick: Duration,
}

impl CacheTargetConfig {
    pub fn new(cached_dev: PathBuf, data_dev: PathBuf, metadata_dev: PathBuf, data_block_size_sectors: u64) -> Self {
        Self {
            cached_dev,
            data_dev,
            metadata_dev,
            data_block_size_sectors,
            ..Default::default()
        }
    }

    /// Validate the constructor-time invariants spec §6 states for the CLI
    /// surface: block size is a power of two and at least 8 sectors.
    pub fn validate(&self) -> Result<(), crate::error::CacheError> {
        if self.data_block_size_sectors < MIN_BLOCK_SIZE_SECTORS
            || !self.data_block_size_sectors.is_power_of_two()
        {
            return Err(crate::error::CacheError::InvalidArg(format!(
                "data_block_size_sectors must be a power of two >= {MIN_BLOCK_SIZE_SECTORS}, got {}",
                self.data_block_size_sectors
            )));
        }
        Ok(())
    }
}

impl Default for CacheTargetConfig {
    fn default() -> Self {
        Self {
            cached_dev: PathBuf::new(),
            data_dev: PathBuf::new(),
            metadata_dev: PathBuf::new(),
            data_block_size_sectors: MIN_BLOCK_SIZE_SECTORS,
            metadata_cache_capacity: crate::blockio::DEFAULT_CACHE_CAPACITY,
            writeback_tick: DEFAULT_WRITEBACK_TICK,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = CacheTargetConfig::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut cfg = CacheTargetConfig::default();
        cfg.data_block_size_sectors = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_block_size_below_minimum() {
        let mut cfg = CacheTargetConfig::default();
        cfg.data_block_size_sectors = 4;
        assert!(cfg.validate().is_err());
    }
}
