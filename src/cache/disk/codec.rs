//! Encoding of values stored in the disk tier.

use crate::decoder::pixels::PixelBuffer;
use crate::errors::{CacheError, CacheResult};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::{Cursor, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// Bytes stored as given
    Raw,
    /// General-purpose zlib blob, for images or any other payload
    Deflate,
    /// Re-encoded as JPEG at the given quality. Lossy.
    Jpeg { quality: u8 },
    /// Re-encoded as PNG
    Png,
}

impl StorageFormat {
    /// Whether `decode_bytes(encode_bytes(x)) == x`
    pub fn preserves_bytes(&self) -> bool {
        matches!(self, Self::Raw | Self::Deflate)
    }

    /// Encode a source payload for storage.
    ///
    /// Re-encoding formats decode the payload as an image first.
    pub fn encode_bytes(&self, bytes: &[u8]) -> CacheResult<Vec<u8>> {
        match self {
            Self::Raw => Ok(bytes.to_vec()),
            Self::Deflate => deflate(bytes),
            Self::Jpeg { .. } | Self::Png => {
                let image = image::load_from_memory(bytes)
                    .map_err(|e| CacheError::encode(format!("payload is not an image: {e}")))?;
                self.encode_dynamic(&image)
            }
        }
    }

    /// Reverse of [`encode_bytes`](Self::encode_bytes) for lossless formats.
    ///
    /// Re-encoded images are returned in their stored encoding, which the
    /// decoder reads directly.
    pub fn decode_bytes(&self, stored: Vec<u8>) -> CacheResult<Vec<u8>> {
        match self {
            Self::Deflate => inflate(&stored),
            Self::Raw | Self::Jpeg { .. } | Self::Png => Ok(stored),
        }
    }

    /// Encode decoded pixels. `Raw` and `Deflate` store a PNG.
    pub fn encode_image(&self, image: &PixelBuffer) -> CacheResult<Vec<u8>> {
        let dynamic = image
            .to_dynamic_image()
            .ok_or_else(|| CacheError::encode("pixel buffer does not match its dimensions"))?;
        match self {
            Self::Raw => encode_png(&dynamic),
            Self::Deflate => deflate(&encode_png(&dynamic)?),
            Self::Jpeg { .. } | Self::Png => self.encode_dynamic(&dynamic),
        }
    }

    fn encode_dynamic(&self, image: &DynamicImage) -> CacheResult<Vec<u8>> {
        match self {
            Self::Jpeg { quality } => {
                // JPEG has no alpha channel
                let opaque = if image.color().has_alpha() {
                    match image {
                        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLuma8(image.to_luma8()),
                        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
                    }
                } else {
                    image.clone()
                };
                let mut out = Vec::new();
                let encoder = JpegEncoder::new_with_quality(&mut out, (*quality).clamp(1, 100));
                opaque
                    .write_with_encoder(encoder)
                    .map_err(|e| CacheError::encode(format!("JPEG encode failed: {e}")))?;
                Ok(out)
            }
            _ => encode_png(image),
        }
    }
}

fn encode_png(image: &DynamicImage) -> CacheResult<Vec<u8>> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| CacheError::encode(format!("PNG encode failed: {e}")))?;
    Ok(out)
}

fn deflate(bytes: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> CacheResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
