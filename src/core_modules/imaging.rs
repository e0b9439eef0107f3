// THEORY:
// The imaging layer is the small set of pixel primitives every stage above it
// is built from. It is deliberately "dumb": each function is a pure transform
// of one buffer into another buffer or a scalar, with no knowledge of frames,
// regions or defects. `imageproc` supplies the textbook operators (Canny,
// Sobel, Gaussian blur, morphology); the two operators the stages need with a
// very specific numeric contract (the 4-neighbour Laplacian with reflected
// borders and box-filter local deviation) are written out here so their
// behaviour is pinned down and testable.
//
// `ScalarMap` is the common currency between stages: a dense row-major `f32`
// field with the handful of reductions the stages need (normalize, mean/std,
// max, crop).

use image::{GrayImage, Luma, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// A dense, row-major 2-D field of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ScalarMap {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width as usize) * (height as usize)],
        }
    }

    /// Wraps an existing buffer. Returns `None` if the length does not match.
    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { width, height, data })
    }

    pub fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = (y as usize) * (self.width as usize) + x as usize;
        self.data[idx] = value;
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(0.0f32, f32::max)
    }

    /// Population mean and standard deviation, accumulated in `f64`.
    pub fn mean_std(&self) -> (f64, f64) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (mean, variance.sqrt())
    }

    /// Scales the field into [0, 1] by its maximum. An all-zero field stays zero.
    pub fn normalized(&self) -> Self {
        let max = self.max();
        if max <= f32::EPSILON {
            return Self::zeros(self.width, self.height);
        }
        self.map(|v| (v / max).clamp(0.0, 1.0))
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Pixel-wise maximum with another field of the same size.
    pub fn max_assign(&mut self, other: &ScalarMap) {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = a.max(b);
        }
    }

    /// `self * self_weight + other * other_weight`, pixel-wise.
    pub fn blend(&self, self_weight: f32, other: &ScalarMap, other_weight: f32) -> Self {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        Self {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| a * self_weight + b * other_weight)
                .collect(),
        }
    }

    /// Weighted sum of equally sized fields. Empty input yields an empty map.
    pub fn weighted_sum(parts: &[(&ScalarMap, f32)]) -> Self {
        let Some((first, _)) = parts.first() else {
            return Self::zeros(0, 0);
        };
        let mut out = Self::zeros(first.width, first.height);
        for (map, weight) in parts {
            debug_assert_eq!(map.dimensions(), out.dimensions());
            for (o, &v) in out.data.iter_mut().zip(map.data.iter()) {
                *o += v * weight;
            }
        }
        out
    }

    /// Copies the sub-rectangle, clipped to the field bounds.
    pub fn crop(&self, rect: PixelBox) -> Self {
        let rect = rect.clipped(self.width, self.height);
        let mut out = Self::zeros(rect.width, rect.height);
        for y in 0..rect.height {
            let src_start = ((rect.y + y) as usize) * (self.width as usize) + rect.x as usize;
            let dst_start = (y as usize) * (rect.width as usize);
            out.data[dst_start..dst_start + rect.width as usize]
                .copy_from_slice(&self.data[src_start..src_start + rect.width as usize]);
        }
        out
    }

    /// Renders a [0, 1] field as an 8-bit image.
    pub fn to_gray_u8(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersects the box with `[0, width) x [0, height)`.
    pub fn clipped(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let right = self.x.saturating_add(self.width).min(width);
        let bottom = self.y.saturating_add(self.height).min(height);
        Self::new(x, y, right - x, bottom - y)
    }
}

/// Rec. 601 luma.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

#[inline]
fn reflect_101(i: i64, n: i64) -> u32 {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as u32
}

/// 4-neighbour Laplacian `[0 1 0; 1 -4 1; 0 1 0]` with reflect-101 borders.
pub fn laplacian(image: &GrayImage) -> ScalarMap {
    let (w, h) = image.dimensions();
    let mut out = ScalarMap::zeros(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let at = |x: i64, y: i64| -> f32 {
        image.get_pixel(reflect_101(x, w as i64), reflect_101(y, h as i64))[0] as f32
    };
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let value = at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y);
            out.set(x as u32, y as u32, value);
        }
    }
    out
}

/// Variance of the Laplacian response; the sharpness measure.
pub fn laplacian_variance(image: &GrayImage) -> f64 {
    let (_, std) = laplacian(image).mean_std();
    std * std
}

/// Gradient magnitude from the 3x3 Sobel pair.
pub fn sobel_magnitude(image: &GrayImage) -> ScalarMap {
    let gx = horizontal_sobel(image);
    let gy = vertical_sobel(image);
    let data = gx
        .as_raw()
        .iter()
        .zip(gy.as_raw().iter())
        .map(|(&dx, &dy)| ((dx as f32).powi(2) + (dy as f32).powi(2)).sqrt())
        .collect();
    ScalarMap {
        width: image.width(),
        height: image.height(),
        data,
    }
}

/// Summed-area table with a zero row and column in front.
fn integral(values: impl Iterator<Item = f64>, width: usize, height: usize) -> Vec<f64> {
    let stride = width + 1;
    let mut table = vec![0.0f64; stride * (height + 1)];
    let mut values = values;
    for y in 0..height {
        let mut row_sum = 0.0;
        for x in 0..width {
            row_sum += values.next().unwrap_or(0.0);
            table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row_sum;
        }
    }
    table
}

/// Standard deviation of intensity over a `window x window` neighbourhood,
/// shrunk at the borders.
pub fn local_std(image: &GrayImage, window: u32) -> ScalarMap {
    let (w, h) = image.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let mut out = ScalarMap::zeros(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let raw = image.as_raw();
    let sum = integral(raw.iter().map(|&v| v as f64), wu, hu);
    let sum_sq = integral(raw.iter().map(|&v| (v as f64) * (v as f64)), wu, hu);
    let stride = wu + 1;
    let radius = (window.max(1) / 2) as usize;

    for y in 0..hu {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius + 1).min(hu);
        for x in 0..wu {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(wu);
            let n = ((x1 - x0) * (y1 - y0)) as f64;
            let s = sum[y1 * stride + x1] - sum[y0 * stride + x1] - sum[y1 * stride + x0] + sum[y0 * stride + x0];
            let s2 = sum_sq[y1 * stride + x1] - sum_sq[y0 * stride + x1] - sum_sq[y1 * stride + x0]
                + sum_sq[y0 * stride + x0];
            let mean = s / n;
            let variance = (s2 / n - mean * mean).max(0.0);
            out.set(x as u32, y as u32, variance.sqrt() as f32);
        }
    }
    out
}

/// Canny edge map as a [0, 1] field (1 on edge pixels).
pub fn canny(image: &GrayImage, low: f32, high: f32) -> ScalarMap {
    let edges = imageproc::edges::canny(image, low, high);
    ScalarMap {
        width: edges.width(),
        height: edges.height(),
        data: edges.as_raw().iter().map(|&v| if v > 0 { 1.0 } else { 0.0 }).collect(),
    }
}

pub fn crop_rgb(image: &RgbImage, rect: PixelBox) -> RgbImage {
    let rect = rect.clipped(image.width(), image.height());
    image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image()
}

pub fn crop_gray(image: &GrayImage, rect: PixelBox) -> GrayImage {
    let rect = rect.clipped(image.width(), image.height());
    image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image()
}
