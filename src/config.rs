use crate::prelude::*;
use crate::region::RegionOptions;
use serde::Deserialize;

/// Tunables for the storage engine. Every field has a default, so a config file only
/// names what it changes:
///
/// ```json
/// { "base_workers": 2, "region_cache_capacity": 64 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub base_workers: usize,
    /// How many connected players justify one more io worker.
    pub participants_per_worker: usize,
    pub max_workers: usize,

    pub region_cache_capacity: usize,
    pub region_idle_secs: u64,

    /// A stream may shrink by this many sectors before it's moved to a tighter run.
    pub shrink_slack: u32,
    pub min_sectors: u32,
    pub compression_level: u32,
    pub extension: String,
}
impl Default for StorageConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            base_workers: (cores / 3).max(1),
            participants_per_worker: 8,
            max_workers: cores.max(1),
            region_cache_capacity: 256,
            region_idle_secs: 300,
            shrink_slack: 2,
            min_sectors: 2,
            compression_level: 4,
            extension: "mca".to_owned(),
        }
    }
}
impl StorageConfig {
    pub fn from_json_str(json: &str) -> io::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.validated()
    }
    pub fn from_json_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let config: Self = serde_json::from_reader(io::BufReader::new(std::fs::File::open(path)?))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.validated()
    }
    fn validated(self) -> io::Result<Self> {
        let invalid = |msg: &str| Err(io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned()));
        if self.base_workers == 0 || self.max_workers < self.base_workers {
            return invalid("need 1 <= base_workers <= max_workers");
        }
        if self.participants_per_worker == 0 {
            return invalid("participants_per_worker must be positive");
        }
        if self.region_cache_capacity == 0 {
            return invalid("region_cache_capacity must be positive");
        }
        if !(1..=crate::region::MAX_SECTORS).contains(&self.min_sectors) {
            return invalid("min_sectors must be in 1..=255");
        }
        if self.compression_level > 9 {
            return invalid("compression_level must be in 0..=9");
        }
        Ok(self)
    }
    pub fn region_idle(&self) -> time::Duration {
        time::Duration::from_secs(self.region_idle_secs)
    }
    pub fn region_options(&self) -> RegionOptions {
        RegionOptions {
            min_sectors: self.min_sectors,
            shrink_slack: self.shrink_slack,
            compression_level: self.compression_level,
        }
    }
}
