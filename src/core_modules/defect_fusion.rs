// THEORY:
// The defect fusion engine turns a handful of registered frames into a single
// per-pixel estimate of physical damage, and a binary mask of where that
// estimate is high.
//
// Key architectural principles:
// 1.  **Per-frame composite**: every frame is scored independently with a
//     blend of four texture signals: a multi-threshold edge composite (fine,
//     medium and strong Canny passes), the absolute Laplacian, the Sobel
//     gradient magnitude and the local intensity deviation. Each signal is
//     normalized to [0, 1] before blending. Edges carry the most weight:
//     creases, tears and scuffs are, first of all, edges that should not be
//     there.
// 2.  **Max pooling**: frames are combined with a pixel-wise maximum. Damage
//     often shows under only one angle of light, so one frame seeing it is
//     enough.
// 3.  **Cross-frame variance**: with two or more frames the pixel-wise
//     variance of intensity is blended in. Reflective damage (stress marks,
//     indentations) changes brightness as the light angle changes even when
//     no single frame shows an edge. Identical frames contribute exactly zero.
//     The pairwise max-difference map can be blended in as well; it keeps a
//     change seen in a single frame that variance would average away.
// 4.  **Oversensitive threshold**: the mask lights every pixel above
//     `mean + k * std` with a small `k`. Missing damage is worse than flagging
//     a clean area for a grader. A light close with a small square element
//     then merges speckle without erasing thin scratches.
//
// The engine is the only writer of the `DefectMap`; every later stage reads it.

use crate::config::FusionConfig;
use crate::core_modules::imaging::{self, ScalarMap, to_gray};
use crate::error::FusionError;
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use rayon::prelude::*;
use tracing::{debug, warn};

pub const MASK_ON: u8 = 255;

#[derive(Debug, Clone)]
pub struct DefectMap {
    /// Fused defect intensity in [0, 1].
    pub intensity: ScalarMap,
    /// Binary defect mask, `MASK_ON` where damage is suspected.
    pub mask: GrayImage,
    /// Normalized cross-frame intensity variance; `None` for a single frame.
    pub variance: Option<ScalarMap>,
    /// Normalized largest pairwise intensity difference; `None` for a single
    /// frame.
    pub max_difference: Option<ScalarMap>,
    /// Share of mask pixels that are on, in percent.
    pub coverage_percent: f64,
    pub threshold: f64,
    pub frames_fused: usize,
}

impl DefectMap {
    pub fn dimensions(&self) -> (u32, u32) {
        self.intensity.dimensions()
    }
}

pub fn mask_coverage_percent(mask: &GrayImage) -> f64 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let lit = mask.as_raw().iter().filter(|&&v| v >= MASK_ON).count();
    lit as f64 * 100.0 / total as f64
}

/// Square closing of a binary mask, `iterations` times over.
pub fn close_mask(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
    let mut out = mask.clone();
    for _ in 0..iterations {
        out = imageproc::morphology::close(&out, Norm::LInf, radius);
    }
    out
}

pub struct DefectFusionEngine {
    config: FusionConfig,
}

impl DefectFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    fn edge_composite(&self, gray: &GrayImage) -> ScalarMap {
        let passes: Vec<ScalarMap> = self
            .config
            .edge_thresholds
            .iter()
            .map(|&(low, high)| imaging::canny(gray, low, high).normalized())
            .collect();
        let parts: Vec<(&ScalarMap, f32)> = passes
            .iter()
            .zip(self.config.edge_weights.iter())
            .map(|(map, &weight)| (map, weight))
            .collect();
        ScalarMap::weighted_sum(&parts).normalized()
    }

    /// The single-frame texture composite, before any cross-frame pooling.
    pub fn frame_composite(&self, gray: &GrayImage) -> ScalarMap {
        let edges = self.edge_composite(gray);
        let laplacian = imaging::laplacian(gray).map(f32::abs).normalized();
        let gradient = imaging::sobel_magnitude(gray).normalized();
        let deviation = imaging::local_std(gray, self.config.local_std_window).normalized();
        let [we, wl, wg, wd] = self.config.component_weights;
        ScalarMap::weighted_sum(&[(&edges, we), (&laplacian, wl), (&gradient, wg), (&deviation, wd)])
    }

    fn intensity_variance(grays: &[GrayImage]) -> ScalarMap {
        let (w, h) = grays[0].dimensions();
        let n = grays.len() as f64;
        let len = (w as usize) * (h as usize);
        let mut sum = vec![0.0f64; len];
        for gray in grays {
            for (s, &v) in sum.iter_mut().zip(gray.as_raw().iter()) {
                *s += v as f64;
            }
        }
        let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let mut sq = vec![0.0f64; len];
        for gray in grays {
            for ((q, &v), &m) in sq.iter_mut().zip(gray.as_raw().iter()).zip(mean.iter()) {
                let d = v as f64 - m;
                *q += d * d;
            }
        }
        let data = sq.iter().map(|q| (q / n) as f32).collect();
        ScalarMap::from_vec(w, h, data).unwrap_or_else(|| ScalarMap::zeros(w, h))
    }

    /// Largest absolute intensity difference between any two frames.
    fn max_difference(grays: &[GrayImage]) -> ScalarMap {
        let (w, h) = grays[0].dimensions();
        let mut out = ScalarMap::zeros(w, h);
        for (i, a) in grays.iter().enumerate() {
            for b in &grays[i + 1..] {
                let diff: Vec<f32> = a
                    .as_raw()
                    .iter()
                    .zip(b.as_raw().iter())
                    .map(|(&p, &q)| (p as f32 - q as f32).abs())
                    .collect();
                if let Some(diff) = ScalarMap::from_vec(w, h, diff) {
                    out.max_assign(&diff);
                }
            }
        }
        out
    }

    /// Fuses the frames into a defect map at the resolution of `frames[0]`.
    /// Frames of a different size are dropped.
    pub fn fuse(&self, frames: &[&RgbImage]) -> Result<DefectMap, FusionError> {
        let Some(reference) = frames.first() else {
            return Err(FusionError::NoFrames);
        };
        let (w, h) = reference.dimensions();
        if w == 0 || h == 0 {
            return Err(FusionError::EmptyReference { width: w, height: h });
        }
        let usable: Vec<&RgbImage> = frames.iter().copied().filter(|f| f.dimensions() == (w, h)).collect();
        if usable.len() < frames.len() {
            warn!(
                dropped = frames.len() - usable.len(),
                width = w,
                height = h,
                "Frames with mismatched dimensions dropped from fusion"
            );
        }

        let grays: Vec<GrayImage> = usable.par_iter().map(|f| to_gray(f)).collect();
        let composites: Vec<ScalarMap> = grays.par_iter().map(|g| self.frame_composite(g)).collect();

        let mut pooled = ScalarMap::zeros(w, h);
        for composite in &composites {
            pooled.max_assign(composite);
        }

        let multi = grays.len() >= 2;
        let variance = multi.then(|| Self::intensity_variance(&grays).normalized());
        let max_difference = multi.then(|| Self::max_difference(&grays).normalized());
        let mut parts: Vec<(&ScalarMap, f32)> = Vec::with_capacity(3);
        let mut pooled_weight = 1.0;
        if let Some(variance) = &variance {
            parts.push((variance, self.config.variance_weight));
            pooled_weight -= self.config.variance_weight;
        }
        if let Some(max_difference) = &max_difference {
            if self.config.max_difference_weight > 0.0 {
                parts.push((max_difference, self.config.max_difference_weight));
                pooled_weight -= self.config.max_difference_weight;
            }
        }
        parts.push((&pooled, pooled_weight.max(0.0)));
        let intensity = ScalarMap::weighted_sum(&parts).map(|v| v.clamp(0.0, 1.0));

        let (mean, std) = intensity.mean_std();
        let threshold = mean + self.config.k_sigma as f64 * std;
        let raw_mask = GrayImage::from_fn(w, h, |x, y| {
            Luma([if intensity.get(x, y) as f64 > threshold { MASK_ON } else { 0 }])
        });
        let mask = close_mask(&raw_mask, self.config.close_radius, self.config.close_iterations);
        let coverage_percent = mask_coverage_percent(&mask);

        debug!(
            frames = grays.len(),
            threshold,
            coverage_percent,
            "Defect map fused"
        );

        Ok(DefectMap {
            intensity,
            mask,
            variance,
            max_difference,
            coverage_percent,
            threshold,
            frames_fused: grays.len(),
        })
    }
}
