//! Planar homography estimation for frame registration.
//!
//! - Hartley-normalised direct linear transform from four or more
//!   correspondences, solved as the smallest eigenvector of `AᵀA`.
//! - Seeded RANSAC around it, refit on the final inlier set.

use crate::error::HomographyError;
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;

const MIN_CORRESPONDENCES: usize = 4;

/// Maps `(x, y)` through `h`. `None` for points sent to infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < 1e-12 {
        return None;
    }
    Some([p.x / p.z, p.y / p.z])
}

pub fn transfer_error(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to sqrt(2).
fn normalizer(points: &[[f64; 2]]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let spread = points.iter().map(|p| (p[0] - cx).hypot(p[1] - cy)).sum::<f64>() / n;
    let s = if spread > 1e-12 { std::f64::consts::SQRT_2 / spread } else { 1.0 };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn apply(t: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    [t[(0, 0)] * p[0] + t[(0, 2)], t[(1, 1)] * p[1] + t[(1, 2)]]
}

/// Direct linear transform: `H` with `dst ≈ H · src`.
pub fn estimate_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES || src.len() != dst.len() {
        return Err(HomographyError::TooFewPoints {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }

    let t_src = normalizer(src);
    let t_dst = normalizer(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let [x, y] = apply(&t_src, src[i]);
        let [u, v] = apply(&t_dst, dst[i]);
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        a[(r, 8)] = -u;
        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        a[(r + 1, 8)] = -v;
    }

    let eigen = SymmetricEigen::new(a.transpose() * &a);
    let smallest = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .ok_or_else(|| HomographyError::Degenerate("empty eigen decomposition".into()))?;
    let h = eigen.eigenvectors.column(smallest);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::Degenerate("normalizer not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    if h[(2, 2)].abs() < 1e-12 || h.determinant().abs() < 1e-12 {
        return Err(HomographyError::Degenerate("singular homography".into()));
    }
    Ok(h / h[(2, 2)])
}

#[derive(Debug, Clone)]
pub struct RansacParams {
    pub iterations: usize,
    /// Maximum transfer error, in pixels, of an inlier.
    pub threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            iterations: 1000,
            threshold: 5.0,
            min_inliers: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub h: Matrix3<f64>,
    pub inliers: usize,
}

fn twice_triangle_area(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    ((b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1])).abs()
}

/// Four points with any three (nearly) collinear cannot define a homography.
fn is_degenerate_sample(points: &[[f64; 2]; 4]) -> bool {
    const MIN_TWICE_AREA: f64 = 1.0;
    [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)]
        .iter()
        .any(|&(i, j, k)| twice_triangle_area(points[i], points[j], points[k]) < MIN_TWICE_AREA)
}

fn inlier_mask(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst.iter())
        .map(|(&s, &d)| transfer_error(h, s, d) < threshold)
        .collect()
}

/// Outlier-robust fit of `dst ≈ H · src`.
pub fn fit_ransac(src: &[[f64; 2]], dst: &[[f64; 2]], params: &RansacParams) -> Result<RansacFit, HomographyError> {
    let n = src.len().min(dst.len());
    if n < MIN_CORRESPONDENCES {
        return Err(HomographyError::TooFewPoints {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Matrix3<f64>, usize)> = None;

    for _ in 0..params.iterations.max(1) {
        let picked = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES).into_vec();
        let sample_src = [src[picked[0]], src[picked[1]], src[picked[2]], src[picked[3]]];
        let sample_dst = [dst[picked[0]], dst[picked[1]], dst[picked[2]], dst[picked[3]]];
        if is_degenerate_sample(&sample_src) || is_degenerate_sample(&sample_dst) {
            continue;
        }
        let Ok(h) = estimate_dlt(&sample_src, &sample_dst) else {
            continue;
        };
        let count = inlier_mask(&h, &src[..n], &dst[..n], params.threshold)
            .iter()
            .filter(|&&inlier| inlier)
            .count();
        if best.as_ref().is_none_or(|(_, c)| count > *c) {
            best = Some((h, count));
            if count * 10 >= n * 9 {
                break;
            }
        }
    }

    let Some((best_h, best_count)) = best else {
        return Err(HomographyError::Degenerate("every sample was degenerate".into()));
    };
    if best_count < params.min_inliers.max(MIN_CORRESPONDENCES) {
        return Err(HomographyError::InsufficientInliers {
            needed: params.min_inliers.max(MIN_CORRESPONDENCES),
            found: best_count,
        });
    }

    let mask = inlier_mask(&best_h, &src[..n], &dst[..n], params.threshold);
    let (in_src, in_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = (0..n)
        .filter(|&i| mask[i])
        .map(|i| (src[i], dst[i]))
        .unzip();
    let h = estimate_dlt(&in_src, &in_dst).unwrap_or(best_h);
    let inliers = inlier_mask(&h, &src[..n], &dst[..n], params.threshold)
        .iter()
        .filter(|&&inlier| inlier)
        .count();

    if inliers >= best_count {
        Ok(RansacFit { h, inliers })
    } else {
        Ok(RansacFit {
            h: best_h,
            inliers: best_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_h() -> Matrix3<f64> {
        Matrix3::new(1.02, 0.03, 5.0, -0.02, 0.98, -3.0, 1e-5, 2e-5, 1.0)
    }

    fn grid_points() -> Vec<[f64; 2]> {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                pts.push([20.0 + i as f64 * 37.0, 15.0 + j as f64 * 29.0]);
            }
        }
        pts
    }

    #[test]
    fn test_dlt_recovers_exact_homography() {
        let h_true = reference_h();
        let src = grid_points();
        let dst: Vec<[f64; 2]> = src.iter().map(|p| project(&h_true, p[0], p[1]).unwrap()).collect();
        let h = estimate_dlt(&src, &dst).unwrap();
        for p in &src {
            let a = project(&h, p[0], p[1]).unwrap();
            let b = project(&h_true, p[0], p[1]).unwrap();
            assert!((a[0] - b[0]).abs() < 1e-6 && (a[1] - b[1]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dlt_needs_four_points() {
        let pts = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert_eq!(
            estimate_dlt(&pts, &pts),
            Err(HomographyError::TooFewPoints { needed: 4, got: 3 })
        );
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let h_true = reference_h();
        let src = grid_points();
        let mut dst: Vec<[f64; 2]> = src.iter().map(|p| project(&h_true, p[0], p[1]).unwrap()).collect();
        for (k, d) in dst.iter_mut().enumerate().filter(|(k, _)| k % 5 == 0) {
            d[0] += 40.0 + k as f64;
            d[1] -= 25.0;
        }
        let fit = fit_ransac(&src, &dst, &RansacParams::default()).unwrap();
        assert_eq!(fit.inliers, src.len() - src.len().div_ceil(5));
        let p = project(&fit.h, 100.0, 80.0).unwrap();
        let q = project(&h_true, 100.0, 80.0).unwrap();
        assert!((p[0] - q[0]).abs() < 0.5 && (p[1] - q[1]).abs() < 0.5);
    }

    #[test]
    fn test_ransac_rejects_collinear_input() {
        let src: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, 2.0 * i as f64]).collect();
        assert!(fit_ransac(&src, &src, &RansacParams::default()).is_err());
    }
}
