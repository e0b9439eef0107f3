// THEORY:
// The frame aligner brings every golden frame into the pixel grid of the
// reference frame, so the fusion stage can compare "the same point of the item"
// across frames. Handheld frames that passed the stability filter are close to
// registered already; alignment removes the residual drift.
//
// The pipeline for one target frame:
// 1.  **Features**: FAST corners on the grayscale frame, strongest first and
//     thinned so they do not clump, each described by a 256-bit binary
//     intensity-comparison descriptor sampled on a blurred copy of the frame.
// 2.  **Matching**: Hamming nearest neighbours, kept only when the match is
//     mutual, then the best fixed number of matches by distance.
// 3.  **Model**: a RANSAC homography from target to reference.
// 4.  **Warp**: the target is resampled into the reference grid.
//
// Every failure (too few matches, no consensus, singular model) is local to
// one frame and degrades to the unwarped frame with a logged reason. Frames are
// independent of each other and are aligned in parallel.

use crate::config::AlignmentConfig;
use crate::core_modules::frame::SelectedFrame;
use crate::core_modules::homography::{RansacParams, fit_ransac};
use crate::core_modules::imaging::to_gray;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::corners::corners_fast9;
use imageproc::geometric_transformations::{Interpolation, Projection, warp};
use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

const PATCH_RADIUS: i32 = 12;
const BORDER: u32 = PATCH_RADIUS as u32 + 1;
const DESCRIPTOR_BITS: usize = 256;
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;
const MIN_KEYPOINT_SPACING: i64 = 3;
const MAX_MATCH_DISTANCE: u32 = 80;
/// Below this corner displacement a frame is treated as already registered.
const REGISTERED_TOLERANCE_PX: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum Alignment {
    Reference,
    Warped { inliers: usize },
    AlreadyRegistered { inliers: usize },
    Unaligned { reason: String },
}

#[derive(Debug, Clone)]
pub struct AlignedFrame {
    pub source: SelectedFrame,
    pub warped: Option<RgbImage>,
    pub alignment: Alignment,
}

impl AlignedFrame {
    /// The pixels to use downstream: warped when available.
    pub fn image(&self) -> &RgbImage {
        self.warped.as_ref().unwrap_or(&self.source.image)
    }
}

type Descriptor = [u64; 4];

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: u32,
    y: u32,
    descriptor: Descriptor,
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub struct FrameAligner {
    config: AlignmentConfig,
    pattern: Vec<[(i32, i32); 2]>,
}

impl FrameAligner {
    pub fn new(config: AlignmentConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| {
                let mut point = || {
                    (
                        rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
                        rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
                    )
                };
                [point(), point()]
            })
            .collect();
        Self { config, pattern }
    }

    fn describe(&self, blurred: &GrayImage, x: u32, y: u32) -> Descriptor {
        let mut descriptor = [0u64; 4];
        for (bit, [a, b]) in self.pattern.iter().enumerate() {
            let pa = blurred.get_pixel((x as i32 + a.0) as u32, (y as i32 + a.1) as u32)[0];
            let pb = blurred.get_pixel((x as i32 + b.0) as u32, (y as i32 + b.1) as u32)[0];
            if pa < pb {
                descriptor[bit / 64] |= 1u64 << (bit % 64);
            }
        }
        descriptor
    }

    fn features(&self, image: &RgbImage) -> Vec<Keypoint> {
        let gray = to_gray(image);
        let (w, h) = gray.dimensions();
        if w <= 2 * BORDER || h <= 2 * BORDER {
            return Vec::new();
        }
        let mut corners = corners_fast9(&gray, self.config.fast_threshold);
        corners.retain(|c| c.x >= BORDER && c.y >= BORDER && c.x < w - BORDER && c.y < h - BORDER);
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut kept: Vec<(u32, u32)> = Vec::with_capacity(self.config.max_keypoints);
        for corner in corners {
            if kept.len() >= self.config.max_keypoints {
                break;
            }
            let crowded = kept.iter().any(|&(kx, ky)| {
                (kx as i64 - corner.x as i64).abs() < MIN_KEYPOINT_SPACING
                    && (ky as i64 - corner.y as i64).abs() < MIN_KEYPOINT_SPACING
            });
            if !crowded {
                kept.push((corner.x, corner.y));
            }
        }

        let blurred = imageproc::filter::gaussian_blur_f32(&gray, DESCRIPTOR_BLUR_SIGMA);
        kept.into_iter()
            .map(|(x, y)| Keypoint {
                x,
                y,
                descriptor: self.describe(&blurred, x, y),
            })
            .collect()
    }

    /// Mutual nearest neighbours, best `max_matches` by distance.
    fn match_features(&self, reference: &[Keypoint], target: &[Keypoint]) -> Vec<(usize, usize)> {
        if reference.is_empty() || target.is_empty() {
            return Vec::new();
        }
        let nearest = |from: &Keypoint, pool: &[Keypoint]| -> (usize, u32) {
            pool.iter()
                .enumerate()
                .map(|(i, k)| (i, hamming(&from.descriptor, &k.descriptor)))
                .min_by_key(|&(_, d)| d)
                .unwrap_or((0, u32::MAX))
        };

        let mut matches: Vec<(usize, usize, u32)> = reference
            .iter()
            .enumerate()
            .filter_map(|(ri, rk)| {
                let (ti, distance) = nearest(rk, target);
                let (back, _) = nearest(&target[ti], reference);
                (back == ri && distance <= MAX_MATCH_DISTANCE).then_some((ri, ti, distance))
            })
            .collect();
        matches.sort_by_key(|&(_, _, d)| d);
        matches.truncate(self.config.max_matches);
        matches.into_iter().map(|(r, t, _)| (r, t)).collect()
    }

    fn align_one(&self, reference: &[Keypoint], target: SelectedFrame) -> AlignedFrame {
        let unaligned = |target: SelectedFrame, reason: String| {
            warn!(frame_index = target.index(), %reason, "Alignment skipped");
            AlignedFrame {
                source: target,
                warped: None,
                alignment: Alignment::Unaligned { reason },
            }
        };

        let features = self.features(&target.image);
        let matches = self.match_features(reference, &features);
        if matches.len() < self.config.min_matches.max(4) {
            let reason = format!("{} good matches", matches.len());
            return unaligned(target, reason);
        }

        let src: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(_, t)| [features[t].x as f64, features[t].y as f64])
            .collect();
        let dst: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(r, _)| [reference[r].x as f64, reference[r].y as f64])
            .collect();
        let params = RansacParams {
            iterations: self.config.ransac_iterations,
            threshold: self.config.ransac_threshold,
            min_inliers: self.config.min_inliers,
            seed: self.config.seed ^ target.index() as u64,
        };
        let fit = match fit_ransac(&src, &dst, &params) {
            Ok(fit) => fit,
            Err(e) => return unaligned(target, e.to_string()),
        };

        let (w, h) = target.image.dimensions();
        if max_corner_displacement(&fit.h, w, h) < REGISTERED_TOLERANCE_PX {
            debug!(frame_index = target.index(), inliers = fit.inliers, "Frame already registered");
            return AlignedFrame {
                source: target,
                warped: None,
                alignment: Alignment::AlreadyRegistered { inliers: fit.inliers },
            };
        }

        let m = fit.h;
        let projection = Projection::from_matrix([
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ]);
        let Some(projection) = projection else {
            return unaligned(target, "homography is not invertible".to_string());
        };
        let warped = warp(&target.image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]));
        debug!(frame_index = target.index(), inliers = fit.inliers, "Frame warped onto reference");
        AlignedFrame {
            source: target,
            warped: Some(warped),
            alignment: Alignment::Warped { inliers: fit.inliers },
        }
    }

    /// Registers `targets` onto `reference`. The reference comes back first,
    /// followed by the targets in their original order.
    pub fn align(&self, reference: SelectedFrame, targets: Vec<SelectedFrame>) -> Vec<AlignedFrame> {
        let reference_features = self.features(&reference.image);
        debug!(
            frame_index = reference.index(),
            keypoints = reference_features.len(),
            "Reference features extracted"
        );

        let mut aligned = Vec::with_capacity(targets.len() + 1);
        aligned.push(AlignedFrame {
            source: reference,
            warped: None,
            alignment: Alignment::Reference,
        });
        let rest: Vec<AlignedFrame> = targets
            .into_par_iter()
            .map(|target| self.align_one(&reference_features, target))
            .collect();
        aligned.extend(rest);
        aligned
    }
}

fn max_corner_displacement(h: &Matrix3<f64>, width: u32, height: u32) -> f64 {
    let (w, hgt) = (width as f64, height as f64);
    [[0.0, 0.0], [w, 0.0], [0.0, hgt], [w, hgt]]
        .iter()
        .map(|&[x, y]| match crate::core_modules::homography::project(h, x, y) {
            Some([px, py]) => (px - x).hypot(py - y),
            None => f64::INFINITY,
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::FrameCandidate;

    fn candidate(index: usize) -> FrameCandidate {
        FrameCandidate {
            frame_index: index,
            sharpness: 100.0,
            motion: 0.0,
            timestamp_seconds: index as f64 / 30.0,
        }
    }

    /// Scattered bright and dark blocks on a mid-gray field: plenty of corners.
    fn blocks(w: u32, h: u32, dx: i32, dy: i32) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(7);
        let rects: Vec<(i32, i32, i32, i32, u8)> = (0..40)
            .map(|_| {
                (
                    rng.random_range(10..w as i32 - 40),
                    rng.random_range(10..h as i32 - 40),
                    rng.random_range(8..30),
                    rng.random_range(8..30),
                    if rng.random_bool(0.5) { 235 } else { 20 },
                )
            })
            .collect();
        RgbImage::from_fn(w, h, |x, y| {
            let (sx, sy) = (x as i32 - dx, y as i32 - dy);
            let mut v = 128u8;
            for &(rx, ry, rw, rh, c) in &rects {
                if sx >= rx && sx < rx + rw && sy >= ry && sy < ry + rh {
                    v = c;
                }
            }
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_identical_frames_are_already_registered() {
        let aligner = FrameAligner::new(AlignmentConfig::default());
        let frame = blocks(240, 180, 0, 0);
        let out = aligner.align(
            SelectedFrame::new(candidate(0), frame.clone()),
            vec![SelectedFrame::new(candidate(20), frame)],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].alignment, Alignment::Reference);
        assert!(matches!(out[1].alignment, Alignment::AlreadyRegistered { .. }));
        assert!(out[1].warped.is_none());
    }

    #[test]
    fn test_shifted_frame_is_warped_back() {
        let aligner = FrameAligner::new(AlignmentConfig::default());
        let reference = blocks(240, 180, 0, 0);
        let shifted = blocks(240, 180, 6, 4);
        let out = aligner.align(
            SelectedFrame::new(candidate(0), reference.clone()),
            vec![SelectedFrame::new(candidate(30), shifted)],
        );
        assert!(matches!(out[1].alignment, Alignment::Warped { .. }), "{:?}", out[1].alignment);
        let warped = out[1].image();
        // Away from the exposed border the warped frame matches the reference.
        let mut diff = 0u64;
        let mut count = 0u64;
        for y in 20..160 {
            for x in 20..220 {
                diff += (warped.get_pixel(x, y)[0] as i64 - reference.get_pixel(x, y)[0] as i64).unsigned_abs();
                count += 1;
            }
        }
        assert!((diff as f64 / count as f64) < 10.0);
    }

    #[test]
    fn test_featureless_frame_stays_unaligned() {
        let aligner = FrameAligner::new(AlignmentConfig::default());
        let flat = RgbImage::from_pixel(120, 90, Rgb([90, 90, 90]));
        let out = aligner.align(
            SelectedFrame::new(candidate(0), blocks(120, 90, 0, 0)),
            vec![SelectedFrame::new(candidate(15), flat)],
        );
        assert!(matches!(out[1].alignment, Alignment::Unaligned { .. }));
        assert_eq!(out[1].image().get_pixel(0, 0), &Rgb([90, 90, 90]));
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming(&[0, 0, 0, 0], &[0, 0, 0, 0]), 0);
        assert_eq!(hamming(&[u64::MAX, 0, 1, 0], &[0, 0, 0, 0]), 65);
    }
}
