// THEORY:
// The object localizer finds the collectible inside the frame so background
// pixels (table, hands, wall) never reach the defect stages. It only has to be
// right about one thing: the outline of the largest object in view.
//
// Edges are detected on a lightly blurred grayscale frame, thickened with two
// 3x3 dilations so the outline closes into a ring, and traced into contours.
// Only outer borders (contours with no parent) are considered, which discards
// every scratch and printed detail inside the item. The largest outer border
// by enclosed area wins, but only if it covers a meaningful share of the frame;
// a small winner is almost always a logo or a glare spot, not the item.
//
// The `Quadrilateral` mode additionally requires the outline to simplify into
// a four-vertex polygon, which lets it accept items filling as little as a
// tenth of the frame. Its corners are ordered (top-left, top-right,
// bottom-right, bottom-left) and every frame is warped through them onto an
// upright rectangle as long as the longer of each pair of opposite edges, so a
// tilted slab reaches fusion without background in its corners.
//
// A rejected localization is not an error: the caller receives `FullFrame` and
// switches to frame-relative regions.

use crate::config::{LocalizationConfig, LocalizerMode};
use crate::core_modules::imaging::{PixelBox, crop_rgb, to_gray};
use image::{Rgb, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use serde::Serialize;
use tracing::{debug, warn};

/// A four-cornered item outline and the upright size it is rectified to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemQuad {
    /// Frame coordinates, ordered top-left, top-right, bottom-right, bottom-left.
    pub corners: [(f32, f32); 4],
    pub width: u32,
    pub height: u32,
}

impl ItemQuad {
    /// Orders the corners and sizes the target from the longer of each pair
    /// of opposite edges.
    pub fn from_corners(points: [(f32, f32); 4]) -> Self {
        let corners = order_corners(points);
        let [tl, tr, br, bl] = corners;
        let width = distance(tl, tr).max(distance(bl, br)).round().max(1.0) as u32;
        let height = distance(tl, bl).max(distance(tr, br)).round().max(1.0) as u32;
        Self { corners, width, height }
    }

    /// Axis-aligned bounds of the corners.
    pub fn bounds(&self) -> PixelBox {
        let xs = self.corners.map(|c| c.0);
        let ys = self.corners.map(|c| c.1);
        let min_x = xs.iter().copied().fold(f32::INFINITY, f32::min).max(0.0);
        let min_y = ys.iter().copied().fold(f32::INFINITY, f32::min).max(0.0);
        let max_x = xs.iter().copied().fold(0.0f32, f32::max);
        let max_y = ys.iter().copied().fold(0.0f32, f32::max);
        PixelBox::new(
            min_x.floor() as u32,
            min_y.floor() as u32,
            (max_x - min_x).ceil().max(1.0) as u32 + 1,
            (max_y - min_y).ceil().max(1.0) as u32 + 1,
        )
    }

    /// Warps the quadrilateral onto an upright `width x height` image. `None`
    /// when the corners are degenerate.
    pub fn rectify(&self, frame: &RgbImage) -> Option<RgbImage> {
        let (w, h) = (self.width as f32, self.height as f32);
        let target = [(0.0, 0.0), (w - 1.0, 0.0), (w - 1.0, h - 1.0), (0.0, h - 1.0)];
        let projection = Projection::from_control_points(self.corners, target)?;
        let mut upright = RgbImage::new(self.width, self.height);
        warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut upright);
        Some(upright)
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Top-left has the smallest `x + y`, bottom-right the largest; top-right has
/// the smallest `y - x`, bottom-left the largest.
pub fn order_corners(points: [(f32, f32); 4]) -> [(f32, f32); 4] {
    let pick = |key: fn(&(f32, f32)) -> f32, largest: bool| {
        let ranked = points.iter().copied();
        let chosen = if largest {
            ranked.max_by(|a, b| key(a).total_cmp(&key(b)))
        } else {
            ranked.min_by(|a, b| key(a).total_cmp(&key(b)))
        };
        chosen.unwrap_or(points[0])
    };
    let sum: fn(&(f32, f32)) -> f32 = |p| p.0 + p.1;
    let diff: fn(&(f32, f32)) -> f32 = |p| p.1 - p.0;
    [pick(sum, false), pick(diff, false), pick(sum, true), pick(diff, true)]
}

/// Outcome of localization, carried alongside the frames it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "geometry")]
pub enum Localization {
    Object(PixelBox),
    Quad(ItemQuad),
    FullFrame,
}

impl Localization {
    /// The crop to apply to a `width x height` frame.
    pub fn crop_box(&self, width: u32, height: u32) -> PixelBox {
        match self {
            Localization::Object(b) => b.clipped(width, height),
            Localization::Quad(quad) => quad.bounds().clipped(width, height),
            Localization::FullFrame => PixelBox::full(width, height),
        }
    }

    pub fn is_object(&self) -> bool {
        !matches!(self, Localization::FullFrame)
    }

    /// The item as later stages see it: rectified for a quadrilateral, cropped
    /// otherwise. A quadrilateral that cannot be warped falls back to its
    /// bounding crop.
    pub fn extract(&self, frame: &RgbImage) -> RgbImage {
        let (w, h) = frame.dimensions();
        if let Localization::Quad(quad) = self {
            if let Some(upright) = quad.rectify(frame) {
                return upright;
            }
            warn!(corners = ?quad.corners, "Degenerate item outline, cropping its bounds instead");
        }
        crop_rgb(frame, self.crop_box(w, h))
    }
}

/// Shoelace area of a closed polygon.
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        twice += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (twice as f64 / 2.0).abs()
}

/// Simplification of a traced outline can end on a vertex that duplicates its
/// start; fold it away so a rectangle counts four corners.
fn drop_closing_vertex(mut polygon: Vec<Point<i32>>, epsilon: f64) -> Vec<Point<i32>> {
    if polygon.len() > 3 {
        let (first, last) = (polygon[0], polygon[polygon.len() - 1]);
        let (dx, dy) = ((first.x - last.x) as f64, (first.y - last.y) as f64);
        if (dx * dx + dy * dy).sqrt() <= epsilon {
            polygon.pop();
        }
    }
    polygon
}

fn bounds(points: &[Point<i32>]) -> Option<PixelBox> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(PixelBox::new(
        min_x.max(0) as u32,
        min_y.max(0) as u32,
        (max_x - min_x + 1).max(1) as u32,
        (max_y - min_y + 1).max(1) as u32,
    ))
}

pub struct ObjectLocalizer {
    config: LocalizationConfig,
}

impl ObjectLocalizer {
    pub fn new(config: LocalizationConfig) -> Self {
        Self { config }
    }

    fn min_area_fraction(&self) -> f64 {
        match self.config.mode {
            LocalizerMode::BoundingContour => self.config.min_area_fraction,
            LocalizerMode::Quadrilateral => self.config.quad_min_area_fraction,
        }
    }

    pub fn locate(&self, frame: &RgbImage) -> Localization {
        let (w, h) = frame.dimensions();
        if w < 3 || h < 3 {
            return Localization::FullFrame;
        }
        let gray = to_gray(frame);
        let blurred = if self.config.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        };
        let mut edges = imageproc::edges::canny(&blurred, self.config.canny_low, self.config.canny_high);
        for _ in 0..self.config.dilate_iterations {
            edges = imageproc::morphology::dilate(&edges, Norm::LInf, 1);
        }

        let mut outlines: Vec<(f64, Vec<Point<i32>>)> = find_contours::<i32>(&edges)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .map(|c| (polygon_area(&c.points), c.points))
            .collect();
        outlines.sort_by(|a, b| b.0.total_cmp(&a.0));

        let frame_area = w as f64 * h as f64;
        let min_area = self.min_area_fraction() * frame_area;

        let large = outlines.iter().filter(|(area, _)| *area > min_area);
        let localization = match self.config.mode {
            LocalizerMode::BoundingContour => large
                .take(1)
                .find_map(|(_, pts)| bounds(pts))
                .map(|found| Localization::Object(self.pad(found, w, h))),
            LocalizerMode::Quadrilateral => large
                .filter_map(|(_, pts)| {
                    let epsilon = self.config.quad_epsilon_fraction * arc_length(pts, true);
                    let polygon = drop_closing_vertex(approximate_polygon_dp(pts, epsilon, true), epsilon);
                    (polygon.len() == 4 && polygon_area(&polygon) > min_area).then_some(polygon)
                })
                .next()
                .map(|polygon| {
                    let points = [0, 1, 2, 3].map(|i| (polygon[i].x as f32, polygon[i].y as f32));
                    Localization::Quad(ItemQuad::from_corners(points))
                }),
        };

        localization.unwrap_or_else(|| {
            debug!(
                largest_fraction = outlines.first().map(|(a, _)| a / frame_area).unwrap_or(0.0),
                required_fraction = self.min_area_fraction(),
                "No outline large enough to be the item"
            );
            Localization::FullFrame
        })
    }

    fn pad(&self, found: PixelBox, width: u32, height: u32) -> PixelBox {
        let pad_x = (found.width as f64 * self.config.padding_fraction).round() as u32;
        let pad_y = (found.height as f64 * self.config.padding_fraction).round() as u32;
        let x0 = found.x.saturating_sub(pad_x);
        let y0 = found.y.saturating_sub(pad_y);
        let x1 = (found.x + found.width + pad_x).min(width);
        let y1 = (found.y + found.height + pad_y).min(height);
        PixelBox::new(x0, y0, x1 - x0, y1 - y0)
    }
}
