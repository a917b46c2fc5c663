// THEORY:
// `frame_ops` holds the stateless per-frame image primitives the presence
// detector is built from: box downscaling to grayscale, a fixed-kernel Gaussian
// blur, absolute difference, binary threshold and 3×3 dilation. Each takes an
// image and returns a new one; none of them knows about time or the background.
//
// Every pass walks the raw row slices of the buffer. A full HD frame is reduced
// by an integer factor before anything else touches it, so the per-frame cost
// stays well inside the exit grace on small boards.
//
// The blur is separable (one horizontal and one vertical 1D pass) with reflected
// borders, and its sigma is derived from the kernel size the same way common
// vision toolkits do when sigma is left at zero. Both the reference and every
// live frame go through the same `GaussianKernel`, which is what makes their
// difference meaningful.

use crate::error::{Result, SenseError};
use image::{GrayImage, RgbImage};

pub const DEFAULT_BLUR_KERNEL: u32 = 21;

/// Frames wider than this are box-downscaled before detection.
pub const DEFAULT_PROCESS_WIDTH: u32 = 640;

/// A normalized 1D Gaussian, applied along both axes.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    size: u32,
    weights: Vec<f32>,
}

impl GaussianKernel {
    pub fn new(size: u32) -> Result<Self> {
        if size == 0 || size % 2 == 0 {
            return Err(SenseError::Config(format!(
                "blur kernel must be a positive odd size (got {size})"
            )));
        }
        Ok(Self::odd(size))
    }

    fn odd(size: u32) -> Self {
        let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
        let radius = (size / 2) as i64;
        let mut weights: Vec<f32> = (-radius..=radius)
            .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp() as f32)
            .collect();
        let total: f32 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= total);
        Self { size, weights }
    }

    /// The kernel covering the same scene extent on a frame shrunk by `factor`.
    pub fn scaled(&self, factor: u32) -> Self {
        if factor <= 1 {
            return self.clone();
        }
        let size = ((self.size as f64 / factor as f64).round() as u32).max(1);
        Self::odd(size | 1)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn blur(&self, src: &GrayImage) -> GrayImage {
        let (width, height) = src.dimensions();
        if width == 0 || height == 0 {
            return src.clone();
        }
        let (w, h) = (width as usize, height as usize);
        let radius = self.weights.len() / 2;
        let raw: &[u8] = src.as_raw();

        let mut horizontal = vec![0f32; w * h];
        let mut padded = vec![0f32; w + 2 * radius];
        for (row, out) in raw.chunks_exact(w).zip(horizontal.chunks_exact_mut(w)) {
            for (i, cell) in padded.iter_mut().enumerate() {
                *cell = row[reflect(i as i64 - radius as i64, width) as usize] as f32;
            }
            for (o, window) in out.iter_mut().zip(padded.windows(self.weights.len())) {
                *o = window.iter().zip(&self.weights).map(|(v, k)| v * k).sum();
            }
        }

        let mut dst = GrayImage::new(width, height);
        let out: &mut [u8] = &mut dst;
        let mut acc = vec![0f32; w];
        for (y, dst_row) in out.chunks_exact_mut(w).enumerate() {
            acc.fill(0.0);
            for (k, weight) in self.weights.iter().enumerate() {
                let sy = reflect(y as i64 + k as i64 - radius as i64, height) as usize;
                for (a, v) in acc.iter_mut().zip(&horizontal[sy * w..(sy + 1) * w]) {
                    *a += weight * v;
                }
            }
            for (d, a) in dst_row.iter_mut().zip(&acc) {
                *d = a.round().clamp(0.0, 255.0) as u8;
            }
        }
        dst
    }
}

/// Mirror index without repeating the edge pixel (`dcb|abcd|cba`).
fn reflect(i: i64, len: u32) -> u32 {
    let len = len as i64;
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = i.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as u32
}

/// Integer shrink factor that brings `width` to at most `max_width`.
pub fn downscale_factor(width: u32, max_width: u32) -> u32 {
    if max_width == 0 {
        return 1;
    }
    width.div_ceil(max_width).max(1)
}

/// BT.601 luma, scaled by 256.
fn luma256(px: &[u8]) -> u64 {
    77 * px[0] as u64 + 150 * px[1] as u64 + 29 * px[2] as u64
}

/// Grayscale plus a `factor`×`factor` box average in one pass.
///
/// Trailing columns and rows that do not fill a whole block are dropped,
/// except when the frame is smaller than one block.
pub fn downscale_gray(frame: &RgbImage, factor: u32) -> GrayImage {
    let factor = factor.max(1);
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return GrayImage::new(width, height);
    }
    let (out_w, out_h) = ((width / factor).max(1), (height / factor).max(1));
    let f = factor as usize;
    let (w, ow) = (width as usize, out_w as usize);
    let cols = (ow * f).min(w);
    let rows = (out_h as usize * f).min(height as usize);
    let raw: &[u8] = frame.as_raw();

    let mut dst = GrayImage::new(out_w, out_h);
    let out: &mut [u8] = &mut dst;
    let mut sums = vec![0u64; ow];
    for (oy, dst_row) in out.chunks_exact_mut(ow).enumerate() {
        sums.fill(0);
        let y0 = oy * f;
        let y1 = (y0 + f).min(rows);
        for src_row in raw[y0 * w * 3..y1 * w * 3].chunks_exact(w * 3) {
            for (x, px) in src_row.chunks_exact(3).take(cols).enumerate() {
                sums[x / f] += luma256(px);
            }
        }
        for (ox, (d, sum)) in dst_row.iter_mut().zip(&sums).enumerate() {
            let block_w = f.min(cols - ox * f) as u64;
            let denom = 256 * block_w * (y1 - y0) as u64;
            *d = ((sum + denom / 2) / denom) as u8;
        }
    }
    dst
}

pub fn to_gray(frame: &RgbImage) -> GrayImage {
    downscale_gray(frame, 1)
}

pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(SenseError::Camera(format!(
            "frame size {:?} does not match reference {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let mut dst = GrayImage::new(a.width(), a.height());
    let out: &mut [u8] = &mut dst;
    for ((d, x), y) in out.iter_mut().zip(a.as_raw()).zip(b.as_raw()) {
        *d = x.abs_diff(*y);
    }
    Ok(dst)
}

/// 255 where the pixel is strictly above `level`, 0 elsewhere.
pub fn threshold(src: &GrayImage, level: u8) -> GrayImage {
    let mut dst = GrayImage::new(src.width(), src.height());
    let out: &mut [u8] = &mut dst;
    for (d, v) in out.iter_mut().zip(src.as_raw()) {
        *d = if *v > level { 255 } else { 0 };
    }
    dst
}

/// 3×3 square dilation, repeated `iterations` times.
///
/// Runs as a horizontal then a vertical 3-wide max, which is the same square.
pub fn dilate(src: &GrayImage, iterations: u32) -> GrayImage {
    let mut current = src.clone();
    let (w, h) = (src.width() as usize, src.height() as usize);
    if w == 0 || h == 0 {
        return current;
    }
    let mut rows = vec![0u8; w * h];
    for _ in 0..iterations {
        let data: &mut [u8] = &mut current;
        for (src_row, dst_row) in data.chunks_exact(w).zip(rows.chunks_exact_mut(w)) {
            for (x, d) in dst_row.iter_mut().enumerate() {
                let lo = x.saturating_sub(1);
                let hi = (x + 1).min(w - 1);
                *d = src_row[lo..=hi].iter().copied().max().unwrap_or(0);
            }
        }
        for (y, dst_row) in data.chunks_exact_mut(w).enumerate() {
            let lo = y.saturating_sub(1);
            let hi = (y + 1).min(h - 1);
            dst_row.copy_from_slice(&rows[lo * w..(lo + 1) * w]);
            for r in lo + 1..=hi {
                for (d, v) in dst_row.iter_mut().zip(&rows[r * w..(r + 1) * w]) {
                    *d = (*d).max(*v);
                }
            }
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let kernel = GaussianKernel::new(DEFAULT_BLUR_KERNEL).unwrap();
        let weights = kernel.weights();
        assert_eq!(weights.len(), 21);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(weights[0], weights[20]);
        assert!(weights[10] > weights[9]);
    }

    #[test]
    fn even_kernel_is_rejected() {
        assert!(GaussianKernel::new(20).is_err());
        assert!(GaussianKernel::new(0).is_err());
    }

    #[test]
    fn blur_keeps_flat_images_flat() {
        let flat = GrayImage::from_pixel(30, 20, Luma([77]));
        let blurred = GaussianKernel::new(21).unwrap().blur(&flat);
        assert!(blurred.pixels().all(|p| p[0] == 77));
    }

    #[test]
    fn blur_spreads_a_point() {
        let mut img = GrayImage::new(9, 9);
        img.put_pixel(4, 4, Luma([255]));
        let blurred = GaussianKernel::new(3).unwrap().blur(&img);
        assert!(blurred.get_pixel(4, 4)[0] < 255);
        assert!(blurred.get_pixel(3, 4)[0] > 0);
        assert_eq!(blurred.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn reflect_mirrors_without_edge_repeat() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(2, 5), 2);
        assert_eq!(reflect(-3, 1), 0);
    }

    #[test]
    fn diff_threshold_dilate() {
        let a = GrayImage::from_pixel(5, 5, Luma([10]));
        let mut b = a.clone();
        b.put_pixel(2, 2, Luma([200]));

        let mask = threshold(&abs_diff(&a, &b).unwrap(), 25);
        assert_eq!(mask.pixels().filter(|p| p[0] == 255).count(), 1);

        let grown = dilate(&mask, 1);
        assert_eq!(grown.pixels().filter(|p| p[0] == 255).count(), 9);
    }

    #[test]
    fn downscale_averages_blocks() {
        let mut frame = RgbImage::from_pixel(7, 4, image::Rgb([0, 0, 0]));
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            frame.put_pixel(x, y, image::Rgb([200, 200, 200]));
        }
        frame.put_pixel(2, 0, image::Rgb([100, 100, 100]));

        let small = downscale_gray(&frame, 2);
        assert_eq!(small.dimensions(), (3, 2));
        assert_eq!(small.get_pixel(0, 0)[0], 200);
        assert_eq!(small.get_pixel(1, 0)[0], 25);
        assert_eq!(small.get_pixel(0, 1)[0], 0);
    }

    #[test]
    fn gray_keeps_neutral_levels() {
        let frame = RgbImage::from_pixel(3, 3, image::Rgb([123, 123, 123]));
        assert!(to_gray(&frame).pixels().all(|p| p[0] == 123));
    }

    #[test]
    fn factor_and_kernel_follow_the_frame_width() {
        assert_eq!(downscale_factor(1920, DEFAULT_PROCESS_WIDTH), 3);
        assert_eq!(downscale_factor(640, DEFAULT_PROCESS_WIDTH), 1);
        assert_eq!(downscale_factor(641, DEFAULT_PROCESS_WIDTH), 2);
        assert_eq!(downscale_factor(64, 0), 1);

        let kernel = GaussianKernel::new(21).unwrap();
        assert_eq!(kernel.scaled(3).size(), 7);
        assert_eq!(kernel.scaled(2).size(), 11);
        assert_eq!(kernel.scaled(1), kernel);
        assert_eq!(GaussianKernel::new(3).unwrap().scaled(8).size(), 1);
    }

    #[test]
    fn dilate_clips_at_borders() {
        let mut mask = GrayImage::new(4, 3);
        mask.put_pixel(0, 0, Luma([255]));
        let grown = dilate(&mask, 1);
        let lit: Vec<(u32, u32)> = grown
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] == 255)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert_eq!(lit, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let a = GrayImage::new(4, 4);
        let b = GrayImage::new(5, 4);
        assert!(matches!(abs_diff(&a, &b), Err(SenseError::Camera(_))));
    }
}
