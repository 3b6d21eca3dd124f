//! In-process LRU cache of decoded images.
//!
//! Entries live in an arena of slots indexed by [`EntryHandle`]. Each slot
//! carries a `cached` count (held by the LRU index) and a `displayed` count
//! (held by outstanding [`DisplayLease`]s). A slot's buffer goes back to the
//! [`BufferPool`] only when both counts are zero and the entry has been
//! displayed at least once.

use super::buffer_pool::BufferPool;
use super::key::CacheKey;
use crate::decoder::pixels::PixelBuffer;
use lru::LruCache;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(u64);

/// Release behaviour of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Reference counted; recycled once uncached and undisplayed
    Counted,
    /// Not reference counted; offered to the pool as soon as it is evicted
    Plain,
}

struct Slot {
    image: Arc<PixelBuffer>,
    weight: u64,
    kind: EntryKind,
    cached: u32,
    displayed: u32,
    has_been_displayed: bool,
}

impl Slot {
    fn is_releasable(&self) -> bool {
        self.cached == 0 && self.displayed == 0 && self.has_been_displayed
    }
}

struct MemoryInner {
    index: LruCache<CacheKey, EntryHandle>,
    slots: HashMap<EntryHandle, Slot>,
    resident_bytes: u64,
    next_handle: u64,
}

/// Result of inserting an image
pub struct CachedImage {
    image: Arc<PixelBuffer>,
    handle: Option<EntryHandle>,
}

impl CachedImage {
    /// An image that never entered the cache
    pub fn detached(image: PixelBuffer) -> Self {
        Self {
            image: Arc::new(image),
            handle: None,
        }
    }

    pub fn image(&self) -> &Arc<PixelBuffer> {
        &self.image
    }

    pub fn is_cached(&self) -> bool {
        self.handle.is_some()
    }
}

/// Shared access to a displayed image; dropping it releases the display count.
pub struct DisplayLease {
    // Must stay ahead of `release`: the image reference is dropped first.
    image: Arc<PixelBuffer>,
    release: Option<DisplayRelease>,
}

struct DisplayRelease {
    handle: EntryHandle,
    store: Weak<MemoryStore>,
}

impl Drop for DisplayRelease {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release_display(self.handle);
        }
    }
}

impl DisplayLease {
    /// A lease for an image the memory store does not track
    pub fn detached(image: Arc<PixelBuffer>) -> Self {
        Self {
            image,
            release: None,
        }
    }

    fn tracked(image: Arc<PixelBuffer>, handle: EntryHandle, store: Weak<MemoryStore>) -> Self {
        Self {
            image,
            release: Some(DisplayRelease { handle, store }),
        }
    }

    pub fn image(&self) -> &PixelBuffer {
        &self.image
    }

    pub fn shared(&self) -> Arc<PixelBuffer> {
        Arc::clone(&self.image)
    }

    pub fn is_tracked(&self) -> bool {
        self.release.is_some()
    }
}

impl Deref for DisplayLease {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        &self.image
    }
}

impl std::fmt::Debug for DisplayLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayLease")
            .field("image", &self.image)
            .field("tracked", &self.release.is_some())
            .finish()
    }
}

pub struct MemoryStore {
    budget: u64,
    pool: Arc<BufferPool>,
    inner: Mutex<MemoryInner>,
    this: Weak<MemoryStore>,
}

impl MemoryStore {
    pub fn new(budget: u64, pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            budget,
            pool,
            inner: Mutex::new(MemoryInner {
                index: LruCache::unbounded(),
                slots: HashMap::new(),
                resident_bytes: 0,
                next_handle: 1,
            }),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Weight of an image in budget units (bytes of its allocation)
    pub fn weight_of(image: &PixelBuffer) -> u64 {
        (image.allocation_bytes() as u64).max(1)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().resident_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().index.contains(key)
    }

    /// Look up and mark as displayed, promoting the entry to most recent.
    pub fn get(&self, key: &CacheKey) -> Option<DisplayLease> {
        let mut inner = self.lock();
        let handle = *inner.index.get(key)?;
        let slot = inner.slots.get_mut(&handle)?;
        slot.displayed += 1;
        slot.has_been_displayed = true;
        Some(DisplayLease::tracked(
            Arc::clone(&slot.image),
            handle,
            self.this.clone(),
        ))
    }

    /// Insert a reference-counted entry, replacing any prior entry for `key`.
    pub fn put(&self, key: CacheKey, image: PixelBuffer) -> CachedImage {
        self.insert(key, image, EntryKind::Counted)
    }

    /// Insert an entry whose buffer is pooled as soon as it is evicted.
    pub fn put_untracked(&self, key: CacheKey, image: PixelBuffer) -> CachedImage {
        self.insert(key, image, EntryKind::Plain)
    }

    fn insert(&self, key: CacheKey, image: PixelBuffer, kind: EntryKind) -> CachedImage {
        let weight = Self::weight_of(&image);
        if weight > self.budget {
            debug!(
                "Image {} ({} bytes) exceeds memory budget of {} bytes, not caching",
                key, weight, self.budget
            );
            return CachedImage::detached(image);
        }

        let image = Arc::new(image);
        let mut recycled = Vec::new();
        let handle = {
            let mut inner = self.lock();
            let handle = EntryHandle(inner.next_handle);
            inner.next_handle += 1;
            inner.slots.insert(
                handle,
                Slot {
                    image: Arc::clone(&image),
                    weight,
                    kind,
                    cached: 1,
                    displayed: 0,
                    has_been_displayed: false,
                },
            );
            inner.resident_bytes += weight;

            if let Some((_, replaced)) = inner.index.push(key, handle) {
                recycled.extend(Self::uncache(&mut inner, replaced));
            }

            while inner.resident_bytes > self.budget {
                let Some((evicted_key, evicted)) = inner.index.pop_lru() else {
                    break;
                };
                trace!("Evicted {} from memory cache", evicted_key);
                recycled.extend(Self::uncache(&mut inner, evicted));
            }
            handle
        };

        for buffer in recycled {
            self.pool.offer(buffer);
        }

        CachedImage {
            image,
            handle: Some(handle),
        }
    }

    /// Start displaying an image returned by [`put`](Self::put).
    pub fn display(&self, cached: &CachedImage) -> DisplayLease {
        if let Some(handle) = cached.handle {
            let mut inner = self.lock();
            if let Some(slot) = inner.slots.get_mut(&handle) {
                slot.displayed += 1;
                slot.has_been_displayed = true;
                return DisplayLease::tracked(Arc::clone(&slot.image), handle, self.this.clone());
            }
        }
        DisplayLease::detached(Arc::clone(&cached.image))
    }

    /// Drop every entry. Displayed entries stay alive until their leases go.
    pub fn evict_all(&self) {
        let mut recycled = Vec::new();
        {
            let mut inner = self.lock();
            while let Some((_, handle)) = inner.index.pop_lru() {
                recycled.extend(Self::uncache(&mut inner, handle));
            }
        }
        debug!("Memory cache cleared, {} buffers recycled", recycled.len());
        for buffer in recycled {
            self.pool.offer(buffer);
        }
    }

    fn release_display(&self, handle: EntryHandle) {
        let recycled = {
            let mut inner = self.lock();
            let Some(slot) = inner.slots.get_mut(&handle) else {
                return;
            };
            slot.displayed = slot.displayed.saturating_sub(1);
            if slot.is_releasable() {
                inner.slots.remove(&handle).and_then(|s| Arc::into_inner(s.image))
            } else {
                None
            }
        };
        if let Some(buffer) = recycled {
            self.pool.offer(buffer);
        }
    }

    /// Remove the cache's claim on a slot, yielding a buffer to recycle if any.
    fn uncache(inner: &mut MemoryInner, handle: EntryHandle) -> Option<PixelBuffer> {
        let slot = inner.slots.get_mut(&handle)?;
        inner.resident_bytes = inner.resident_bytes.saturating_sub(slot.weight);
        slot.cached = 0;

        match slot.kind {
            EntryKind::Counted => {
                if slot.displayed > 0 {
                    return None;
                }
                let slot = inner.slots.remove(&handle)?;
                if slot.has_been_displayed {
                    Arc::into_inner(slot.image)
                } else {
                    None
                }
            }
            EntryKind::Plain => {
                let slot = inner.slots.remove(&handle)?;
                Arc::into_inner(slot.image)
            }
        }
    }
}
