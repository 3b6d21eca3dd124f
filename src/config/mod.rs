use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod serde_helpers;

use crate::cache::buffer_pool::ReuseMode;
use crate::cache::disk::codec::StorageFormat;
use crate::cache::key::HashMode;
use crate::errors::{ConfigError, ConfigResult};
use defaults::*;

/// Memory tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub enabled: bool,
    /// Absolute budget. Takes precedence over `percent_of_available`.
    #[serde(
        with = "serde_helpers::option_byte_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_size: Option<u64>,
    /// Fraction of available system memory, 0.01 to 0.8
    pub percent_of_available: f64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_MEMORY_CACHE_ENABLED,
            max_size: None,
            percent_of_available: DEFAULT_MEMORY_PERCENT,
        }
    }
}

impl MemoryCacheConfig {
    /// Resolve the budget in bytes against current available memory
    pub fn resolve_budget(&self) -> u64 {
        match self.max_size {
            Some(bytes) => bytes,
            None => {
                let mut system = sysinfo::System::new();
                system.refresh_memory();
                budget_from_percent(system.available_memory(), self.percent_of_available)
            }
        }
    }
}

fn budget_from_percent(available: u64, percent: f64) -> u64 {
    (available as f64 * percent).round() as u64
}

/// On-disk image format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    Raw,
    Deflate,
    Jpeg,
    Png,
}

/// Disk tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    #[serde(with = "serde_helpers::byte_size")]
    pub max_size: u64,
    pub format: DiskFormat,
    /// Re-encode quality for `jpeg`, 1 to 100
    pub quality: u8,
    /// Initialize the store while constructing the cache instead of on the housekeeping thread
    pub init_on_create: bool,
    /// Written into the journal header; a mismatch on reopen discards the store
    pub app_id: u32,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_DISK_CACHE_ENABLED,
            directory: PathBuf::from(DEFAULT_DISK_CACHE_DIR),
            max_size: DEFAULT_DISK_CACHE_SIZE,
            format: DiskFormat::Jpeg,
            quality: DEFAULT_DISK_QUALITY,
            init_on_create: DEFAULT_DISK_INIT_ON_CREATE,
            app_id: DEFAULT_DISK_APP_ID,
        }
    }
}

impl DiskCacheConfig {
    pub fn storage_format(&self) -> StorageFormat {
        match self.format {
            DiskFormat::Raw => StorageFormat::Raw,
            DiskFormat::Deflate => StorageFormat::Deflate,
            DiskFormat::Jpeg => StorageFormat::Jpeg {
                quality: self.quality,
            },
            DiskFormat::Png => StorageFormat::Png,
        }
    }
}

/// Retired pixel buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Total capacity of retained buffers before the oldest are dropped
    #[serde(with = "serde_helpers::byte_size")]
    pub max_size: u64,
    pub mode: ReuseMode,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BUFFER_POOL_SIZE,
            mode: ReuseMode::Capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Total decode attempts when allocation fails
    pub attempts: u32,
    #[serde(with = "serde_helpers::duration")]
    pub retry_delay: Duration,
    /// Upper bound on a single decode allocation
    #[serde(
        with = "serde_helpers::option_byte_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_alloc: Option<u64>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DECODE_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_DECODE_RETRY_DELAY_MS),
            max_alloc: None,
        }
    }
}

/// Worker pool sizing and cache keying
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub download_workers: usize,
    /// 0 selects one worker per available core
    pub decode_workers: usize,
    pub key_hash: HashMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            decode_workers: DEFAULT_DECODE_WORKERS,
            key_hash: HashMode::Md5,
        }
    }
}

impl PipelineConfig {
    pub fn effective_decode_workers(&self) -> usize {
        if self.decode_workers > 0 {
            self.decode_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "serde_helpers::duration")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub memory: MemoryCacheConfig,
    pub disk: DiskCacheConfig,
    pub buffer_pool: BufferPoolConfig,
    pub decoder: DecoderConfig,
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let config: Self = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let percent = self.memory.percent_of_available;
        if self.memory.max_size.is_none()
            && !(MIN_MEMORY_PERCENT..=MAX_MEMORY_PERCENT).contains(&percent)
        {
            return Err(ConfigError::invalid(
                "memory.percent_of_available",
                format!(
                    "{percent} is outside {MIN_MEMORY_PERCENT}..={MAX_MEMORY_PERCENT}"
                ),
            ));
        }
        if self.memory.max_size == Some(0) {
            return Err(ConfigError::invalid("memory.max_size", "must be non-zero"));
        }
        if self.disk.enabled && self.disk.max_size == 0 {
            return Err(ConfigError::invalid("disk.max_size", "must be non-zero"));
        }
        if !(1..=100).contains(&self.disk.quality) {
            return Err(ConfigError::invalid(
                "disk.quality",
                format!("{} is outside 1..=100", self.disk.quality),
            ));
        }
        if self.decoder.attempts == 0 {
            return Err(ConfigError::invalid("decoder.attempts", "must be at least 1"));
        }
        if self.pipeline.download_workers == 0 {
            return Err(ConfigError::invalid(
                "pipeline.download_workers",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.disk.max_size, 10 * 1024 * 1024);
        assert_eq!(config.disk.quality, 70);
        assert!(!config.disk.init_on_create);
        assert_eq!(config.pipeline.download_workers, 8);
        assert_eq!(config.decoder.attempts, 2);
        assert_eq!(config.decoder.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_memory_percent_bounds() {
        let mut config = Config::default();
        config.memory.percent_of_available = 0.005;
        assert!(config.validate().is_err());
        config.memory.percent_of_available = 0.81;
        assert!(config.validate().is_err());
        config.memory.percent_of_available = 0.8;
        assert!(config.validate().is_ok());
        config.memory.percent_of_available = 0.01;
        assert!(config.validate().is_ok());

        // An absolute budget bypasses the percentage
        config.memory.percent_of_available = 5.0;
        config.memory.max_size = Some(1024);
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.resolve_budget(), 1024);
    }

    #[test]
    fn test_budget_from_percent() {
        assert_eq!(budget_from_percent(7_000, 1.0 / 7.0), 1_000);
        assert_eq!(budget_from_percent(1_000, 0.5), 500);
    }

    #[test]
    fn test_parse_human_readable_toml() {
        let config: Config = toml::from_str(
            r#"
            [memory]
            max_size = "64MB"

            [disk]
            directory = "/tmp/photos"
            max_size = "20MB"
            format = "deflate"
            init_on_create = true

            [decoder]
            retry_delay = "100ms"

            [pipeline]
            key_hash = "fast"
            "#,
        )
        .unwrap();

        assert_eq!(config.memory.max_size, Some(64 * 1024 * 1024));
        assert_eq!(config.disk.max_size, 20 * 1024 * 1024);
        assert_eq!(config.disk.storage_format(), StorageFormat::Deflate);
        assert!(config.disk.init_on_create);
        assert_eq!(config.decoder.retry_delay, Duration::from_millis(100));
        assert_eq!(config.pipeline.key_hash, HashMode::Fast);
        // Untouched sections keep their defaults
        assert_eq!(config.pipeline.download_workers, 8);
    }

    #[test]
    fn test_load_from_file_writes_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let path_str = path.to_str().unwrap();

        let created = Config::load_from_file(path_str).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_from_file(path_str).unwrap();
        assert_eq!(reloaded.disk.max_size, created.disk.max_size);
        assert_eq!(reloaded.disk.format, created.disk.format);
        assert_eq!(reloaded.decoder.retry_delay, created.decoder.retry_delay);
    }

    #[test]
    fn test_effective_decode_workers() {
        let mut config = PipelineConfig::default();
        assert!(config.effective_decode_workers() >= 1);
        config.decode_workers = 3;
        assert_eq!(config.effective_decode_workers(), 3);
    }
}
