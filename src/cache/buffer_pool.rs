//! Pool of retired pixel buffers reused by the decoder.
//!
//! The pool is an explicit bounded free-list: buffers are retained oldest
//! first until the byte budget is exceeded, at which point the oldest are
//! dropped. `clear` is the reclamation pass run before a decode retry.

use crate::decoder::pixels::{PixelBuffer, PixelFormat};
use crate::decoder::sampling::sampled_dimensions;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// How a pooled buffer is matched against a decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseMode {
    /// Any buffer of the same format with enough capacity for the sampled output
    #[default]
    Capacity,
    /// Same source dimensions and format, only when no downsampling is applied
    ExactMatch,
}

/// What a decode needs from a reused buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShape {
    /// Source width before downsampling
    pub width: u32,
    /// Source height before downsampling
    pub height: u32,
    pub sample_size: u32,
    pub format: PixelFormat,
}

impl BufferShape {
    pub fn output_dimensions(&self) -> (u32, u32) {
        sampled_dimensions(self.width, self.height, self.sample_size)
    }

    pub fn required_bytes(&self) -> usize {
        let (w, h) = self.output_dimensions();
        (w as usize)
            .saturating_mul(h as usize)
            .saturating_mul(self.format.bytes_per_pixel())
    }
}

struct PoolInner {
    buffers: VecDeque<PixelBuffer>,
    retained_bytes: u64,
}

pub struct BufferPool {
    mode: ReuseMode,
    max_bytes: u64,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(mode: ReuseMode, max_bytes: u64) -> Self {
        Self {
            mode,
            max_bytes,
            inner: Mutex::new(PoolInner {
                buffers: VecDeque::new(),
                retained_bytes: 0,
            }),
        }
    }

    pub fn mode(&self) -> ReuseMode {
        self.mode
    }

    /// Retain a buffer for reuse. Immutable or oversized buffers are dropped.
    pub fn offer(&self, buffer: PixelBuffer) {
        let size = buffer.allocation_bytes() as u64;
        if !buffer.is_mutable() || size == 0 || size > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.buffers.push_back(buffer);
        inner.retained_bytes += size;

        while inner.retained_bytes > self.max_bytes {
            let Some(oldest) = inner.buffers.pop_front() else {
                break;
            };
            inner.retained_bytes -= oldest.allocation_bytes() as u64;
            trace!(
                "Dropped pooled buffer {}x{} to stay within {} bytes",
                oldest.width(),
                oldest.height(),
                self.max_bytes
            );
        }
    }

    /// Take the first eligible buffer out of the pool.
    pub fn acquire(&self, shape: &BufferShape) -> Option<PixelBuffer> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let position = inner
            .buffers
            .iter()
            .position(|candidate| self.is_eligible(candidate, shape))?;
        let buffer = inner.buffers.remove(position)?;
        inner.retained_bytes -= buffer.allocation_bytes() as u64;
        Some(buffer)
    }

    pub fn is_eligible(&self, candidate: &PixelBuffer, shape: &BufferShape) -> bool {
        if !candidate.is_mutable() || candidate.format() != shape.format {
            return false;
        }
        match self.mode {
            ReuseMode::Capacity => candidate.allocation_bytes() >= shape.required_bytes(),
            ReuseMode::ExactMatch => {
                shape.sample_size == 1
                    && candidate.width() == shape.width
                    && candidate.height() == shape.height
            }
        }
    }

    /// Drop every retained buffer, returning how many were released.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let released = inner.buffers.len();
        inner.buffers.clear();
        inner.retained_bytes = 0;
        released
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retained_bytes(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retained_bytes
    }
}
