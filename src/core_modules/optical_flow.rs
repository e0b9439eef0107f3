// THEORY:
// Motion between consecutive frames is measured as the mean magnitude of a
// dense optical-flow field. The field is estimated with pyramidal
// Lucas-Kanade: every pixel solves the 2x2 normal equations of the brightness
// constancy constraint over a square window, coarse-to-fine over an image
// pyramid so shifts larger than the window are still recovered.
//
// The frames are first downscaled to a fixed working width. Stability is a
// coarse judgement and the window (given at full resolution) shrinks with the
// frame, so the answer is expressed back in full-resolution pixels.
//
// Pixels whose window has no usable texture (the smaller eigenvalue of the
// structure tensor is too small) keep the flow propagated from the coarser
// level, which is zero for flat regions. Identical frames therefore measure
// exactly zero motion.

use crate::config::FlowConfig;
use crate::core_modules::imaging::ScalarMap;
use image::GrayImage;
use image::imageops::{self, FilterType};

const MIN_LEVEL_SIDE: u32 = 8;
const MIN_EIGEN_PER_PIXEL: f64 = 1e-2;

/// Mean flow magnitude from `prev` to `curr`, in full-resolution pixels.
/// Frames of different sizes cannot be compared and report unbounded motion.
pub fn mean_flow_magnitude(prev: &GrayImage, curr: &GrayImage, params: &FlowConfig) -> f64 {
    if prev.dimensions() != curr.dimensions() {
        return f64::INFINITY;
    }
    let (w, h) = prev.dimensions();
    if w < 2 || h < 2 {
        return 0.0;
    }

    let scale = (params.working_width.max(MIN_LEVEL_SIDE) as f64 / w as f64).min(1.0);
    let (ww, wh) = (
        ((w as f64 * scale).round() as u32).max(2),
        ((h as f64 * scale).round() as u32).max(2),
    );
    let (prev_small, curr_small) = if scale < 1.0 {
        (
            imageops::resize(prev, ww, wh, FilterType::Triangle),
            imageops::resize(curr, ww, wh, FilterType::Triangle),
        )
    } else {
        (prev.clone(), curr.clone())
    };

    let window = ((params.window_size as f64 * scale).round() as u32).max(3) | 1;
    let (u, v) = pyramidal_lk(
        &ScalarMap::from_gray(&prev_small),
        &ScalarMap::from_gray(&curr_small),
        params.pyramid_levels.max(1),
        window / 2,
        params.iterations.max(1),
    );

    let n = u.len().max(1) as f64;
    let total: f64 = u
        .data()
        .iter()
        .zip(v.data().iter())
        .map(|(&du, &dv)| ((du as f64).powi(2) + (dv as f64).powi(2)).sqrt())
        .sum();
    (total / n) / scale
}

fn downsample(plane: &ScalarMap) -> ScalarMap {
    let (w, h) = (plane.width() / 2, plane.height() / 2);
    let mut out = ScalarMap::zeros(w, h);
    for y in 0..h {
        for x in 0..w {
            let sum = plane.get(2 * x, 2 * y)
                + plane.get(2 * x + 1, 2 * y)
                + plane.get(2 * x, 2 * y + 1)
                + plane.get(2 * x + 1, 2 * y + 1);
            out.set(x, y, sum * 0.25);
        }
    }
    out
}

fn upsample_flow(flow: &ScalarMap, width: u32, height: u32) -> ScalarMap {
    let mut out = ScalarMap::zeros(width, height);
    if flow.is_empty() {
        return out;
    }
    for y in 0..height {
        for x in 0..width {
            let sx = (x / 2).min(flow.width() - 1);
            let sy = (y / 2).min(flow.height() - 1);
            out.set(x, y, 2.0 * flow.get(sx, sy));
        }
    }
    out
}

fn bilinear(plane: &ScalarMap, x: f32, y: f32) -> f32 {
    let max_x = (plane.width() - 1) as f32;
    let max_y = (plane.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);
    let p00 = plane.get(x0 as u32, y0 as u32);
    let p10 = plane.get(x1 as u32, y0 as u32);
    let p01 = plane.get(x0 as u32, y1 as u32);
    let p11 = plane.get(x1 as u32, y1 as u32);
    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

/// Per-pixel sums over a `(2r+1)^2` window clipped to the image, plus the
/// number of pixels each window covered.
fn box_sums(values: &[f64], w: usize, h: usize, r: usize) -> (Vec<f64>, Vec<f64>) {
    let stride = w + 1;
    let mut table = vec![0.0f64; stride * (h + 1)];
    for y in 0..h {
        let mut row = 0.0;
        for x in 0..w {
            row += values[y * w + x];
            table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
        }
    }
    let mut sums = vec![0.0; w * h];
    let mut counts = vec![0.0; w * h];
    for y in 0..h {
        let y0 = y.saturating_sub(r);
        let y1 = (y + r + 1).min(h);
        for x in 0..w {
            let x0 = x.saturating_sub(r);
            let x1 = (x + r + 1).min(w);
            sums[y * w + x] =
                table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0] + table[y0 * stride + x0];
            counts[y * w + x] = ((x1 - x0) * (y1 - y0)) as f64;
        }
    }
    (sums, counts)
}

fn gradients(plane: &ScalarMap) -> (Vec<f64>, Vec<f64>) {
    let (w, h) = plane.dimensions();
    let mut ix = vec![0.0; (w * h) as usize];
    let mut iy = vec![0.0; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let xl = x.saturating_sub(1);
            let xr = (x + 1).min(w - 1);
            let yu = y.saturating_sub(1);
            let yd = (y + 1).min(h - 1);
            let idx = (y * w + x) as usize;
            ix[idx] = (plane.get(xr, y) - plane.get(xl, y)) as f64 / (xr - xl).max(1) as f64;
            iy[idx] = (plane.get(x, yd) - plane.get(x, yu)) as f64 / (yd - yu).max(1) as f64;
        }
    }
    (ix, iy)
}

fn refine_level(prev: &ScalarMap, curr: &ScalarMap, u: &mut ScalarMap, v: &mut ScalarMap, radius: u32, iterations: u32) {
    let (w, h) = prev.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let r = radius as usize;
    let (ix, iy) = gradients(prev);

    let ixx: Vec<f64> = ix.iter().map(|g| g * g).collect();
    let ixy: Vec<f64> = ix.iter().zip(iy.iter()).map(|(a, b)| a * b).collect();
    let iyy: Vec<f64> = iy.iter().map(|g| g * g).collect();
    let (sxx, counts) = box_sums(&ixx, wu, hu, r);
    let (sxy, _) = box_sums(&ixy, wu, hu, r);
    let (syy, _) = box_sums(&iyy, wu, hu, r);

    let max_step = (2 * radius + 1) as f32;

    for _ in 0..iterations {
        let mut it = vec![0.0f64; wu * hu];
        for y in 0..h {
            for x in 0..w {
                let warped = bilinear(curr, x as f32 + u.get(x, y), y as f32 + v.get(x, y));
                it[(y * w + x) as usize] = (warped - prev.get(x, y)) as f64;
            }
        }
        let ixt: Vec<f64> = ix.iter().zip(it.iter()).map(|(a, b)| a * b).collect();
        let iyt: Vec<f64> = iy.iter().zip(it.iter()).map(|(a, b)| a * b).collect();
        let (sxt, _) = box_sums(&ixt, wu, hu, r);
        let (syt, _) = box_sums(&iyt, wu, hu, r);

        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) as usize;
                let (a, b, c) = (sxx[idx], sxy[idx], syy[idx]);
                let trace = a + c;
                let lambda_min = 0.5 * (trace - ((a - c).powi(2) + 4.0 * b * b).sqrt());
                if lambda_min / counts[idx] < MIN_EIGEN_PER_PIXEL {
                    continue;
                }
                let det = a * c - b * b;
                if det.abs() < f64::EPSILON {
                    continue;
                }
                let du = (-(c * sxt[idx]) + b * syt[idx]) / det;
                let dv = (b * sxt[idx] - a * syt[idx]) / det;
                u.set(x, y, u.get(x, y) + (du as f32).clamp(-max_step, max_step));
                v.set(x, y, v.get(x, y) + (dv as f32).clamp(-max_step, max_step));
            }
        }
    }
}

/// Dense flow `(u, v)` from `prev` to `curr` at the resolution of the inputs.
fn pyramidal_lk(prev: &ScalarMap, curr: &ScalarMap, levels: u32, radius: u32, iterations: u32) -> (ScalarMap, ScalarMap) {
    let mut prev_pyramid = vec![prev.clone()];
    let mut curr_pyramid = vec![curr.clone()];
    while (prev_pyramid.len() as u32) < levels {
        let Some(last) = prev_pyramid.last() else { break };
        if last.width() / 2 < MIN_LEVEL_SIDE || last.height() / 2 < MIN_LEVEL_SIDE {
            break;
        }
        let next_prev = downsample(last);
        let next_curr = curr_pyramid.last().map(downsample).unwrap_or_else(|| ScalarMap::zeros(0, 0));
        prev_pyramid.push(next_prev);
        curr_pyramid.push(next_curr);
    }

    let coarsest = prev_pyramid.len() - 1;
    let (cw, ch) = prev_pyramid[coarsest].dimensions();
    let mut u = ScalarMap::zeros(cw, ch);
    let mut v = ScalarMap::zeros(cw, ch);

    for level in (0..=coarsest).rev() {
        let (lw, lh) = prev_pyramid[level].dimensions();
        if level != coarsest {
            u = upsample_flow(&u, lw, lh);
            v = upsample_flow(&v, lw, lh);
        }
        refine_level(&prev_pyramid[level], &curr_pyramid[level], &mut u, &mut v, radius, iterations);
    }
    (u, v)
}
