//! Downsample factor selection and box-filter subsampling.

/// Requested display size; the decoder never upscales to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// No downsampling.
    pub fn unbounded() -> Self {
        Self {
            width: u32::MAX,
            height: u32::MAX,
        }
    }
}

const MAX_SAMPLE: u64 = 1 << 30;

/// Power-of-two divisor to apply to both source dimensions.
///
/// Picks the largest factor for which half the source still exceeds the
/// target in both dimensions, then keeps doubling while the sampled pixel
/// count is above twice the target pixel count. The second rule catches
/// extreme aspect ratios such as panoramas.
pub fn compute_downsample(
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
) -> u32 {
    let (width, height) = (u64::from(source_width), u64::from(source_height));
    let (req_width, req_height) = (u64::from(target_width.max(1)), u64::from(target_height.max(1)));

    let mut sample: u64 = 1;
    if height > req_height || width > req_width {
        let half_height = height / 2;
        let half_width = width / 2;

        while half_height / sample > req_height
            && half_width / sample > req_width
            && sample < MAX_SAMPLE
        {
            sample *= 2;
        }

        let mut total_pixels = width * height / sample;
        let pixel_cap = req_width.saturating_mul(req_height).saturating_mul(2);
        while total_pixels > pixel_cap && sample < MAX_SAMPLE {
            sample *= 2;
            total_pixels /= 2;
        }
    }

    sample as u32
}

/// Output dimensions for a given factor, never below 1x1.
pub fn sampled_dimensions(width: u32, height: u32, sample: u32) -> (u32, u32) {
    let sample = sample.max(1);
    ((width / sample).max(1), (height / sample).max(1))
}

/// Average each `sample x sample` block of `src` into one pixel of `dst`.
///
/// `dst` must hold exactly the sampled dimensions times `bpp` bytes.
pub fn subsample_into(
    src: &[u8],
    width: u32,
    height: u32,
    bpp: usize,
    sample: u32,
    dst: &mut [u8],
) {
    let (out_width, out_height) = sampled_dimensions(width, height, sample);
    let (width, height) = (width as usize, height as usize);
    let (out_width, out_height) = (out_width as usize, out_height as usize);
    let sample = sample.max(1) as usize;
    let mut sums = vec![0u64; bpp];

    for oy in 0..out_height {
        let y_start = oy * sample;
        let y_end = (y_start + sample).min(height);
        for ox in 0..out_width {
            let x_start = ox * sample;
            let x_end = (x_start + sample).min(width);
            sums.iter_mut().for_each(|s| *s = 0);

            for y in y_start..y_end {
                let row = &src[(y * width + x_start) * bpp..(y * width + x_end) * bpp];
                for pixel in row.chunks_exact(bpp) {
                    for (sum, &channel) in sums.iter_mut().zip(pixel) {
                        *sum += u64::from(channel);
                    }
                }
            }

            let count = ((y_end - y_start) * (x_end - x_start)).max(1) as u64;
            let out = &mut dst[(oy * out_width + ox) * bpp..(oy * out_width + ox + 1) * bpp];
            for (channel, sum) in out.iter_mut().zip(&sums) {
                *channel = (sum / count) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_panorama_gets_larger_factor() {
        let panorama = compute_downsample(2000, 100, 100, 100);
        let square = compute_downsample(200, 200, 100, 100);
        assert!(panorama > square, "panorama={panorama} square={square}");
        assert_eq!(panorama, 16);
        assert_eq!(square, 2);
    }

    #[rstest]
    #[case(100, 100, 200, 200, 1)]
    #[case(200, 200, 200, 200, 1)]
    #[case(150, 150, 100, 100, 2)]
    #[case(400, 400, 100, 100, 8)]
    #[case(1024, 768, 256, 256, 8)]
    #[case(4000, 3000, 1000, 1000, 8)]
    fn test_compute_downsample_cases(
        #[case] sw: u32,
        #[case] sh: u32,
        #[case] tw: u32,
        #[case] th: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(compute_downsample(sw, sh, tw, th), expected);
    }

    #[test]
    fn test_unbounded_target_never_samples() {
        let target = TargetSize::unbounded();
        assert_eq!(compute_downsample(8000, 6000, target.width, target.height), 1);
    }

    #[test]
    fn test_zero_target_terminates() {
        let sample = compute_downsample(100, 100, 0, 0);
        assert!(sample.is_power_of_two());
    }

    #[test]
    fn test_subsample_averages_blocks() {
        // 2x2 single-channel image sampled by 2 becomes the mean
        let src = [10u8, 20, 30, 40];
        let mut dst = [0u8; 1];
        subsample_into(&src, 2, 2, 1, 2, &mut dst);
        assert_eq!(dst, [25]);
    }

    #[test]
    fn test_subsample_multichannel_edges() {
        // 3x1 RGB sampled by 2 keeps only the first full block
        let src = [0u8, 0, 0, 100, 100, 100, 255, 255, 255];
        let mut dst = [0u8; 3];
        subsample_into(&src, 3, 1, 3, 2, &mut dst);
        assert_eq!(dst, [50, 50, 50]);
    }

    #[test]
    fn test_subsample_huge_block_does_not_overflow() {
        let sample = compute_downsample(10_000, 10_000, 100, 100);
        assert_eq!(sample, 8192);

        let side = sample as usize;
        let src = vec![255u8; side * side];
        let mut dst = [0u8; 1];
        subsample_into(&src, sample, sample, 1, sample, &mut dst);
        assert_eq!(dst, [255]);
    }

    proptest! {
        #[test]
        fn prop_downsample_is_power_of_two_and_deterministic(
            sw in 1u32..20_000,
            sh in 1u32..20_000,
            tw in 1u32..4_000,
            th in 1u32..4_000,
        ) {
            let first = compute_downsample(sw, sh, tw, th);
            prop_assert!(first >= 1);
            prop_assert!(first.is_power_of_two());
            prop_assert_eq!(first, compute_downsample(sw, sh, tw, th));
            if sw <= tw && sh <= th {
                prop_assert_eq!(first, 1);
            }
        }
    }
}
