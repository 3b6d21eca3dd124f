//! Decoded pixel storage.

use crate::errors::{PipelineError, PipelineResult};
use image::{ColorType, DynamicImage, ImageBuffer};
use std::fmt;

/// 8-bit channel layouts produced by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    L8,
    La8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::L8 => 1,
            Self::La8 => 2,
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }

    /// Native 8-bit formats; deeper or float formats are converted to `Rgba8`.
    pub fn from_color_type(color: ColorType) -> Option<Self> {
        match color {
            ColorType::L8 => Some(Self::L8),
            ColorType::La8 => Some(Self::La8),
            ColorType::Rgb8 => Some(Self::Rgb8),
            ColorType::Rgba8 => Some(Self::Rgba8),
            _ => None,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::La8 | Self::Rgba8)
    }
}

/// A decoded image: tightly packed rows of `format` pixels.
///
/// The backing allocation may be larger than `width * height * bpp` when the
/// buffer was taken from the reuse pool.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
            mutable: true,
        }
    }

    /// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
    pub fn allocate(width: u32, height: u32, format: PixelFormat) -> PipelineResult<Self> {
        let len = packed_len(width, height, format)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            PipelineError::exhausted(format!("cannot allocate {len} bytes for {width}x{height}: {e}"))
        })?;
        data.resize(len, 0);
        Ok(Self::new(width, height, format, data))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes of pixel data in use
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Bytes reserved by the backing allocation; this is the cache weight.
    pub fn allocation_bytes(&self) -> usize {
        self.data.capacity()
    }

    /// Immutable buffers are never handed to the reuse pool.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn into_immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Re-purpose this allocation for a new image of the given shape.
    ///
    /// Pixel contents are zeroed. Only grows the allocation if the current
    /// capacity is too small.
    pub(crate) fn reshape(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> PipelineResult<()> {
        let len = packed_len(width, height, format)?;
        self.data.clear();
        if len > self.data.capacity() {
            self.data.try_reserve_exact(len).map_err(|e| {
                PipelineError::exhausted(format!("cannot grow pooled buffer to {len} bytes: {e}"))
            })?;
        }
        self.data.resize(len, 0);
        self.width = width;
        self.height = height;
        self.format = format;
        Ok(())
    }

    /// Copy into an `image` crate buffer for re-encoding.
    pub fn to_dynamic_image(&self) -> Option<DynamicImage> {
        let (w, h) = (self.width, self.height);
        let data = self.data.clone();
        match self.format {
            PixelFormat::L8 => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
            PixelFormat::La8 => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageLumaA8),
            PixelFormat::Rgb8 => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
            PixelFormat::Rgba8 => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("mutable", &self.mutable)
            .finish()
    }
}

fn packed_len(width: u32, height: u32, format: PixelFormat) -> PipelineResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| PipelineError::exhausted(format!("{width}x{height} image overflows usize")))
}
