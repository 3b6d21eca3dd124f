//! Two-pass image decoding sized to a display target.
//!
//! The first pass reads only the header to learn the source dimensions.
//! The second pass decodes pixels and box-subsamples them by the factor
//! [`sampling::compute_downsample`] picks, writing into a pooled buffer
//! when one is compatible.

pub mod pixels;
pub mod sampling;

use crate::cache::buffer_pool::{BufferPool, BufferShape};
use crate::config::DecoderConfig;
use crate::errors::{PipelineError, PipelineResult};
use bytes::Bytes;
use image::error::ImageError;
use image::{DynamicImage, ImageDecoder, ImageReader, Limits};
use pixels::{PixelBuffer, PixelFormat};
use sampling::{TargetSize, compute_downsample, subsample_into};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub struct Decoder {
    pool: Option<Arc<BufferPool>>,
    attempts: u32,
    retry_delay: Duration,
    max_alloc: Option<u64>,
}

impl Decoder {
    pub fn new(config: &DecoderConfig, pool: Option<Arc<BufferPool>>) -> Self {
        Self {
            pool,
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay,
            max_alloc: config.max_alloc,
        }
    }

    /// Header-only pass; allocates no pixel storage.
    pub fn read_dimensions(bytes: &[u8]) -> PipelineResult<(u32, u32)> {
        let reader = guessed_reader(bytes)?;
        let (width, height) = reader.into_dimensions().map_err(map_image_error)?;
        if width == 0 || height == 0 {
            return Err(PipelineError::malformed(format!(
                "image has empty dimensions {width}x{height}"
            )));
        }
        Ok((width, height))
    }

    /// Decode `bytes` for display at `target`. Blocking and CPU-bound.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires at a checkpoint; a
    /// partially written buffer is dropped, never returned.
    pub fn decode(
        &self,
        bytes: &[u8],
        target: TargetSize,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        ensure_live(cancel)?;
        let (width, height) = Self::read_dimensions(bytes)?;
        let sample = compute_downsample(width, height, target.width, target.height);
        trace!(
            "Decoding {}x{} for target {}x{} with sample size {}",
            width, height, target.width, target.height, sample
        );

        ensure_live(cancel)?;
        let mut reader = guessed_reader(bytes)?;
        reader.limits(self.limits());
        let decoder = reader.into_decoder().map_err(map_image_error)?;
        let (width, height) = decoder.dimensions();

        match PixelFormat::from_color_type(decoder.color_type()) {
            Some(format) if sample == 1 => {
                let mut out = self.output_buffer(width, height, sample, format)?;
                decoder.read_image(out.data_mut()).map_err(map_image_error)?;
                ensure_live(cancel)?;
                Ok(out)
            }
            Some(format) => {
                let len = usize::try_from(decoder.total_bytes()).map_err(|_| {
                    PipelineError::exhausted(format!("{width}x{height} image overflows usize"))
                })?;
                let mut scratch = Vec::new();
                scratch.try_reserve_exact(len).map_err(|e| {
                    PipelineError::exhausted(format!("cannot allocate {len} byte scratch: {e}"))
                })?;
                scratch.resize(len, 0);
                decoder.read_image(&mut scratch).map_err(map_image_error)?;
                self.finish_scratch(&scratch, width, height, sample, format, cancel)
            }
            None => {
                // 16-bit and float sources are normalised to 8-bit RGBA
                let image = DynamicImage::from_decoder(decoder)
                    .map_err(map_image_error)?
                    .into_rgba8();
                self.finish_scratch(image.as_raw(), width, height, sample, PixelFormat::Rgba8, cancel)
            }
        }
    }

    /// Decode on the blocking pool, retrying allocation failures.
    ///
    /// Before each retry the buffer pool is drained and the task waits
    /// `retry_delay`, unless cancelled first.
    pub async fn decode_with_retry(
        self: &Arc<Self>,
        bytes: Bytes,
        target: TargetSize,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        let mut attempt = 1;
        loop {
            let decoder = Arc::clone(self);
            let input = bytes.clone();
            let token = cancel.clone();
            let result = tokio::task::spawn_blocking(move || decoder.decode(&input, target, &token))
                .await
                .map_err(|e| PipelineError::malformed(format!("decode task failed: {e}")))?;

            match result {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        "Decode attempt {}/{} failed: {}; reclaiming pooled buffers",
                        attempt, self.attempts, e
                    );
                    if let Some(pool) = &self.pool {
                        let dropped = pool.clear();
                        debug!("Dropped {} pooled buffers before retry", dropped);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        if let Some(max_alloc) = self.max_alloc {
            limits.max_alloc = Some(max_alloc);
        }
        limits
    }

    /// A zeroed output buffer for the sampled shape, reused from the pool if possible.
    fn output_buffer(
        &self,
        width: u32,
        height: u32,
        sample: u32,
        format: PixelFormat,
    ) -> PipelineResult<PixelBuffer> {
        let shape = BufferShape {
            width,
            height,
            sample_size: sample,
            format,
        };
        let (out_width, out_height) = shape.output_dimensions();

        if let Some(mut reused) = self.pool.as_ref().and_then(|pool| pool.acquire(&shape)) {
            trace!(
                "Reusing pooled buffer of {} bytes for {}x{}",
                reused.allocation_bytes(),
                out_width,
                out_height
            );
            reused.reshape(out_width, out_height, format)?;
            return Ok(reused);
        }
        PixelBuffer::allocate(out_width, out_height, format)
    }

    /// Checkpoint after a full-size decode, then sample into the output buffer.
    /// Nothing is taken from the pool once cancelled.
    fn finish_scratch(
        &self,
        src: &[u8],
        width: u32,
        height: u32,
        sample: u32,
        format: PixelFormat,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        ensure_live(cancel)?;
        self.subsample(src, width, height, sample, format)
    }

    fn subsample(
        &self,
        src: &[u8],
        width: u32,
        height: u32,
        sample: u32,
        format: PixelFormat,
    ) -> PipelineResult<PixelBuffer> {
        let mut out = self.output_buffer(width, height, sample, format)?;
        if sample == 1 {
            out.data_mut().copy_from_slice(src);
        } else {
            subsample_into(src, width, height, format.bytes_per_pixel(), sample, out.data_mut());
        }
        Ok(out)
    }
}

fn guessed_reader(bytes: &[u8]) -> PipelineResult<ImageReader<Cursor<&[u8]>>> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::malformed(format!("unreadable image header: {e}")))?;
    if reader.format().is_none() {
        return Err(PipelineError::malformed("unrecognised image format"));
    }
    Ok(reader)
}

fn ensure_live(cancel: &CancellationToken) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn map_image_error(error: ImageError) -> PipelineError {
    match error {
        ImageError::Limits(e) => PipelineError::exhausted(format!("decode limit exceeded: {e}")),
        ImageError::IoError(e) => PipelineError::malformed(format!("truncated image data: {e}")),
        other => PipelineError::malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::buffer_pool::ReuseMode;
    use crate::errors::ErrorKind;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::sync::Barrier;
    use tracing_test::traced_test;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn decoder(pool: Option<Arc<BufferPool>>) -> Decoder {
        Decoder::new(&DecoderConfig::default(), pool)
    }

    #[test]
    fn test_read_dimensions_only() {
        assert_eq!(Decoder::read_dimensions(&png(40, 30)).unwrap(), (40, 30));
    }

    #[test]
    fn test_full_size_decode() {
        let out = decoder(None)
            .decode(&png(20, 10), TargetSize::unbounded(), &CancellationToken::new())
            .unwrap();
        assert_eq!((out.width(), out.height()), (20, 10));
        assert_eq!(out.format(), PixelFormat::Rgb8);
        assert_eq!(&out.data()[..3], &[0, 0, 128]);
    }

    #[test]
    fn test_downsampled_decode() {
        let out = decoder(None)
            .decode(&png(200, 200), TargetSize::new(100, 100), &CancellationToken::new())
            .unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn test_malformed_bytes() {
        let err = decoder(None)
            .decode(b"definitely not an image", TargetSize::unbounded(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
    }

    #[test]
    fn test_truncated_png_is_malformed() {
        let mut bytes = png(64, 64);
        bytes.truncate(bytes.len() / 2);
        let err = decoder(None)
            .decode(&bytes, TargetSize::unbounded(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
    }

    #[test]
    fn test_cancelled_before_decode() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = decoder(None)
            .decode(&png(8, 8), TargetSize::unbounded(), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_cancelled_after_full_size_read_takes_nothing_from_pool() {
        let pool = Arc::new(BufferPool::new(ReuseMode::Capacity, 1024 * 1024));
        pool.offer(PixelBuffer::allocate(64, 64, PixelFormat::Rgb8).unwrap());
        let decoder = decoder(Some(Arc::clone(&pool)));
        let scratch = vec![7u8; 64 * 64 * 3];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = decoder
            .finish_scratch(&scratch, 64, 64, 2, PixelFormat::Rgb8, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!pool.is_empty());

        let out = decoder
            .finish_scratch(&scratch, 64, 64, 2, PixelFormat::Rgb8, &CancellationToken::new())
            .unwrap();
        assert_eq!((out.width(), out.height()), (32, 32));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cancelled_mid_decode_returns_no_buffer() {
        let bytes = png(2048, 2048);
        let cancel = CancellationToken::new();
        let started = Arc::new(Barrier::new(2));

        let worker = {
            let cancel = cancel.clone();
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                started.wait();
                decoder(None).decode(&bytes, TargetSize::new(64, 64), &cancel)
            })
        };
        started.wait();
        cancel.cancel();

        let err = worker.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_reuses_pooled_buffer() {
        let pool = Arc::new(BufferPool::new(ReuseMode::Capacity, 1024 * 1024));
        pool.offer(PixelBuffer::allocate(64, 64, PixelFormat::Rgb8).unwrap());
        let decoder = decoder(Some(Arc::clone(&pool)));

        let out = decoder
            .decode(&png(32, 32), TargetSize::unbounded(), &CancellationToken::new())
            .unwrap();
        assert!(pool.is_empty());
        assert_eq!(out.allocation_bytes(), 64 * 64 * 3);
        assert_eq!(out.byte_len(), 32 * 32 * 3);
    }

    #[test]
    fn test_allocation_limit_is_resource_exhausted() {
        let config = DecoderConfig {
            max_alloc: Some(16),
            ..DecoderConfig::default()
        };
        let err = Decoder::new(&config, None)
            .decode(&png(64, 64), TargetSize::unbounded(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_drains_pool_then_fails() {
        let pool = Arc::new(BufferPool::new(ReuseMode::Capacity, 1024 * 1024));
        pool.offer(PixelBuffer::allocate(8, 8, PixelFormat::L8).unwrap());
        let config = DecoderConfig {
            attempts: 2,
            retry_delay: Duration::from_millis(1),
            max_alloc: Some(16),
        };
        let decoder = Arc::new(Decoder::new(&config, Some(Arc::clone(&pool))));

        let err = decoder
            .decode_with_retry(Bytes::from(png(64, 64)), TargetSize::unbounded(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(pool.is_empty());
        assert!(logs_contain("reclaiming pooled buffers"));
    }
}
