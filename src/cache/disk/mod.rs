//! Disk tier of the image cache.
//!
//! [`ByteStore`] wraps a [`DiskLruStore`] with deferred initialization and
//! a silent disabled mode. Construction performs no I/O; callers that reach
//! `get`/`put` before [`ByteStore::initialize`] has run block until it
//! completes.

pub mod codec;
pub mod journal;
pub mod store;

use crate::cache::key::CacheKey;
use crate::config::DiskCacheConfig;
use crate::decoder::pixels::PixelBuffer;
use crate::utils::format_memory;
use codec::StorageFormat;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use store::{DiskLruStore, Snapshot};
use tracing::{debug, info, warn};

pub use store::Editor;

/// Externally visible state of the disk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    /// Waiting for `initialize`
    Pending,
    Ready,
    /// Closed by housekeeping; a later `initialize` reopens it
    Closed,
    /// Turned off by configuration or because the directory was unusable
    Disabled,
}

enum DiskState {
    Pending,
    Initializing,
    Ready(Arc<DiskLruStore>),
    Closed,
    Disabled,
}

pub struct ByteStore {
    config: DiskCacheConfig,
    format: StorageFormat,
    state: Mutex<DiskState>,
    ready: Condvar,
}

impl ByteStore {
    pub fn new(config: DiskCacheConfig) -> Self {
        let state = if config.enabled {
            DiskState::Pending
        } else {
            DiskState::Disabled
        };
        Self {
            format: config.storage_format(),
            config,
            state: Mutex::new(state),
            ready: Condvar::new(),
        }
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DiskStatus {
        match *self.lock() {
            DiskState::Pending | DiskState::Initializing => DiskStatus::Pending,
            DiskState::Ready(_) => DiskStatus::Ready,
            DiskState::Closed => DiskStatus::Closed,
            DiskState::Disabled => DiskStatus::Disabled,
        }
    }

    /// Create the directory, check free space and open the store.
    ///
    /// Blocking. Does nothing unless the tier is pending or closed.
    pub fn initialize(&self) {
        {
            let mut state = self.lock();
            if !matches!(*state, DiskState::Pending | DiskState::Closed) {
                return;
            }
            *state = DiskState::Initializing;
        }
        self.open_and_publish();
    }

    fn open_and_publish(&self) {
        let next = match self.open_store() {
            Ok(store) => {
                info!(
                    "Disk cache ready at {} ({} of {} used)",
                    self.config.directory.display(),
                    format_memory(store.size()),
                    format_memory(self.config.max_size)
                );
                DiskState::Ready(Arc::new(store))
            }
            Err(reason) => {
                warn!(
                    "Disk cache at {} disabled: {}",
                    self.config.directory.display(),
                    reason
                );
                DiskState::Disabled
            }
        };
        *self.lock() = next;
        self.ready.notify_all();
    }

    fn open_store(&self) -> Result<DiskLruStore, String> {
        let directory = &self.config.directory;
        std::fs::create_dir_all(directory)
            .map_err(|e| format!("cannot create directory: {e}"))?;

        if let Some(available) = available_space(directory)
            && available < self.config.max_size
        {
            return Err(format!(
                "only {} available, budget is {}",
                format_memory(available),
                format_memory(self.config.max_size)
            ));
        }

        DiskLruStore::open(directory, self.config.app_id, self.config.max_size)
            .map_err(|e| e.to_string())
    }

    /// Wait out initialization and return the open store, if any.
    fn store(&self) -> Option<Arc<DiskLruStore>> {
        let mut state = self.lock();
        while matches!(*state, DiskState::Pending | DiskState::Initializing) {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*state {
            DiskState::Ready(store) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store()
            .is_some_and(|store| store.contains(key.as_str()))
    }

    /// Raw read handle on the stored encoding.
    pub fn get_snapshot(&self, key: &CacheKey) -> Option<Snapshot> {
        let store = self.store()?;
        match store.get(key.as_str()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Disk cache read of {} failed: {}", key, e);
                None
            }
        }
    }

    /// Stored payload decoded back from the storage format.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let snapshot = self.get_snapshot(key)?;
        let stored = match snapshot.into_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Disk cache read of {} failed: {}", key, e);
                return None;
            }
        };
        match self.format.decode_bytes(stored) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Disk cache entry {} is undecodable, dropping: {}", key, e);
                self.remove(key);
                None
            }
        }
    }

    /// Store `bytes`, replacing any existing value.
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        let encoded = match self.format.encode_bytes(bytes) {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("Not caching {} on disk: {}", key, e);
                return false;
            }
        };
        write_entry(&store, key, &encoded)
    }

    /// Store `bytes` only if `key` is absent. Returns whether a write happened.
    pub fn put_if_absent(&self, key: &CacheKey, bytes: &[u8]) -> bool {
        !self.contains(key) && self.put(key, bytes)
    }

    /// Store decoded pixels if `key` is absent, encoded per the storage format.
    pub fn put_image_if_absent(&self, key: &CacheKey, image: &PixelBuffer) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        if store.contains(key.as_str()) {
            return false;
        }
        match self.format.encode_image(image) {
            Ok(encoded) => write_entry(&store, key, &encoded),
            Err(e) => {
                debug!("Not caching decoded {} on disk: {}", key, e);
                false
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.store()
            .is_some_and(|store| store.remove(key.as_str()).unwrap_or(false))
    }

    /// Delete everything on disk and reopen empty.
    pub fn clear(&self) {
        let previous = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, DiskState::Initializing) {
                DiskState::Ready(store) => Some(store),
                DiskState::Disabled if !self.config.enabled => {
                    *state = DiskState::Disabled;
                    return;
                }
                _ => None,
            }
        };

        if let Some(store) = previous {
            if let Err(e) = store.delete() {
                warn!("Failed to delete disk cache contents: {}", e);
            }
        } else if let Err(e) = std::fs::remove_dir_all(&self.config.directory)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to delete disk cache directory: {}", e);
        }
        info!("Disk cache cleared at {}", self.config.directory.display());
        self.open_and_publish();
    }

    pub fn flush(&self) {
        if let DiskState::Ready(store) = &*self.lock()
            && let Err(e) = store.flush()
        {
            warn!("Disk cache flush failed: {}", e);
        }
    }

    /// Close the journal. Subsequent reads and writes are no-ops.
    pub fn close(&self) {
        let previous = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, DiskState::Closed) {
                DiskState::Ready(store) => Some(store),
                other => {
                    *state = other;
                    None
                }
            }
        };
        self.ready.notify_all();
        if let Some(store) = previous {
            if let Err(e) = store.close() {
                warn!("Disk cache close failed: {}", e);
            }
            debug!("Disk cache closed");
        }
    }
}

fn write_entry(store: &DiskLruStore, key: &CacheKey, bytes: &[u8]) -> bool {
    let result = store.edit(key.as_str()).and_then(|mut editor| {
        editor.write_all(bytes)?;
        editor.commit()
    });
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!("Disk cache write of {} failed: {}", key, e);
            false
        }
    }
}

/// Free space on the filesystem holding `path`, if it can be determined.
fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
