use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::buffer::EventBufferConfig;
use crate::error::Result;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;
pub const DEFAULT_BUFFER_BATCH_SIZE: usize = 100;
pub const DEFAULT_BUFFER_FLUSH_INTERVAL_MS: u64 = 250;

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_buffer_batch_size() -> usize {
    DEFAULT_BUFFER_BATCH_SIZE
}

fn default_buffer_flush_interval_ms() -> u64 {
    DEFAULT_BUFFER_FLUSH_INTERVAL_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBufferSettings {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_buffer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_buffer_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for EventBufferSettings {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            batch_size: default_buffer_batch_size(),
            flush_interval_ms: default_buffer_flush_interval_ms(),
        }
    }
}

impl EventBufferSettings {
    pub fn to_buffer_config(&self) -> EventBufferConfig {
        EventBufferConfig {
            capacity: self.capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// RocksDB directory for the persistent store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Entity payload cache size; 0 disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub event_buffer: EventBufferSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_capacity: default_cache_capacity(),
            event_buffer: EventBufferSettings::default(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: StoreConfig = toml::from_str("data_dir = \"/tmp/fleet\"").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/fleet"));
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.event_buffer.batch_size, DEFAULT_BUFFER_BATCH_SIZE);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = StoreConfig::default();
        config.event_buffer.batch_size = 7;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: StoreConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.event_buffer.batch_size, 7);
    }
}
