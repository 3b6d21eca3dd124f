/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Memory tier defaults
pub const DEFAULT_MEMORY_CACHE_ENABLED: bool = true;
/// One seventh of available memory.
pub const DEFAULT_MEMORY_PERCENT: f64 = 1.0 / 7.0;
pub const MIN_MEMORY_PERCENT: f64 = 0.01;
pub const MAX_MEMORY_PERCENT: f64 = 0.8;

// Disk tier defaults
pub const DEFAULT_DISK_CACHE_ENABLED: bool = true;
pub const DEFAULT_DISK_CACHE_DIR: &str = "./data/image-cache";
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_DISK_QUALITY: u8 = 70;
pub const DEFAULT_DISK_INIT_ON_CREATE: bool = false;
pub const DEFAULT_DISK_APP_ID: u32 = 1;

// Buffer pool defaults
pub const DEFAULT_BUFFER_POOL_SIZE: u64 = 32 * 1024 * 1024;

// Decoder defaults
pub const DEFAULT_DECODE_ATTEMPTS: u32 = 2;
pub const DEFAULT_DECODE_RETRY_DELAY_MS: u64 = 250;

// Pipeline defaults
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 8;
/// Zero means one decode worker per available core.
pub const DEFAULT_DECODE_WORKERS: usize = 0;

// HTTP defaults
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_USER_AGENT: &str = concat!("photo-pipeline/", env!("CARGO_PKG_VERSION"));
