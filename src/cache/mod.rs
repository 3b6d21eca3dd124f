//! Two-tier image cache.
//!
//! An [`ImageCache`] is constructed explicitly and shared by `Arc` with
//! every component that needs it. It owns the memory tier, the disk tier
//! and the buffer pool the memory tier recycles into.

pub mod buffer_pool;
pub mod disk;
pub mod key;
pub mod memory;

use crate::config::Config;
use crate::decoder::pixels::PixelBuffer;
use crate::utils::format_memory;
use buffer_pool::BufferPool;
use disk::ByteStore;
use key::{CacheKey, KeyHasher};
use memory::{CachedImage, DisplayLease, MemoryStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Housekeeping operations, run off the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCommand {
    InitDisk,
    Clear,
    Flush,
    Close,
}

pub struct ImageCache {
    hasher: KeyHasher,
    memory: Option<Arc<MemoryStore>>,
    disk: Arc<ByteStore>,
    pool: Arc<BufferPool>,
}

impl ImageCache {
    /// Build both tiers from configuration.
    ///
    /// With `disk.init_on_create` the disk tier is opened here, blocking;
    /// otherwise it stays pending until [`CacheCommand::InitDisk`] runs.
    pub fn new(config: &Config) -> Self {
        let pool = Arc::new(BufferPool::new(
            config.buffer_pool.mode,
            config.buffer_pool.max_size,
        ));

        let memory = config.memory.enabled.then(|| {
            let budget = config.memory.resolve_budget();
            info!("Memory cache budget: {}", format_memory(budget));
            MemoryStore::new(budget, Arc::clone(&pool))
        });

        let disk = Arc::new(ByteStore::new(config.disk.clone()));
        if config.disk.enabled && config.disk.init_on_create {
            disk.initialize();
        }

        Self {
            hasher: KeyHasher::new(config.pipeline.key_hash),
            memory,
            disk,
            pool,
        }
    }

    /// Assemble a cache from already-built tiers.
    pub fn from_parts(
        hasher: KeyHasher,
        memory: Option<Arc<MemoryStore>>,
        disk: Arc<ByteStore>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            hasher,
            memory,
            disk,
            pool,
        }
    }

    pub fn key_for(&self, identifier: &str) -> CacheKey {
        self.hasher.hash(identifier)
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn disk(&self) -> &Arc<ByteStore> {
        &self.disk
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Memory-tier lookup for display
    pub fn lookup(&self, key: &CacheKey) -> Option<DisplayLease> {
        self.memory.as_ref()?.get(key)
    }

    /// Insert a decoded image into the memory tier.
    pub fn store_decoded(&self, key: &CacheKey, image: PixelBuffer) -> CachedImage {
        match &self.memory {
            Some(memory) => memory.put(key.clone(), image),
            None => CachedImage::detached(image),
        }
    }

    /// Begin displaying an image returned by [`store_decoded`](Self::store_decoded).
    pub fn display(&self, cached: &CachedImage) -> DisplayLease {
        match &self.memory {
            Some(memory) => memory.display(cached),
            None => DisplayLease::detached(Arc::clone(cached.image())),
        }
    }

    pub fn clear(&self) {
        if let Some(memory) = &self.memory {
            memory.evict_all();
        }
        self.pool.clear();
        self.disk.clear();
    }

    /// Execute a housekeeping command. Blocking.
    pub fn run(&self, command: CacheCommand) {
        debug!("Running cache command {:?}", command);
        match command {
            CacheCommand::InitDisk => self.disk.initialize(),
            CacheCommand::Clear => self.clear(),
            CacheCommand::Flush => self.disk.flush(),
            CacheCommand::Close => self.disk.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::DiskStatus;
    use crate::decoder::pixels::PixelFormat;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.memory.max_size = Some(1024 * 1024);
        config.disk.directory = dir.path().join("cache");
        config
    }

    #[test]
    fn test_lazy_disk_until_init_command() {
        let dir = TempDir::new().unwrap();
        let cache = ImageCache::new(&config(&dir));
        assert_eq!(cache.disk().status(), DiskStatus::Pending);

        cache.run(CacheCommand::InitDisk);
        assert_eq!(cache.disk().status(), DiskStatus::Ready);

        cache.run(CacheCommand::Close);
        assert_eq!(cache.disk().status(), DiskStatus::Closed);
    }

    #[test]
    fn test_eager_disk_init() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.disk.init_on_create = true;
        let cache = ImageCache::new(&config);
        assert_eq!(cache.disk().status(), DiskStatus::Ready);
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.disk.format = crate::config::DiskFormat::Raw;
        let cache = ImageCache::new(&config);
        cache.run(CacheCommand::InitDisk);

        let key = cache.key_for("http://example.com/a.png");
        cache.store_decoded(&key, PixelBuffer::allocate(4, 4, PixelFormat::Rgba8).unwrap());
        cache.disk().put(&key, b"bytes");
        assert!(cache.lookup(&key).is_some());

        cache.run(CacheCommand::Clear);
        assert!(cache.lookup(&key).is_none());
        assert_eq!(cache.disk().get(&key), None);
    }

    #[test]
    fn test_memory_disabled_still_displays() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.memory.enabled = false;
        let cache = ImageCache::new(&config);
        assert!(cache.memory().is_none());

        let key = cache.key_for("a");
        let cached = cache.store_decoded(&key, PixelBuffer::allocate(2, 2, PixelFormat::L8).unwrap());
        assert!(!cached.is_cached());
        assert_eq!(cache.display(&cached).width(), 2);
        assert!(cache.lookup(&key).is_none());
    }
}
