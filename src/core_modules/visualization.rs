// THEORY:
// Visualization renders the stage outputs a human grader looks at: the binary
// defect mask, a colour heat map of the fused intensity, the reference frame
// with the region boxes and a red tint over masked pixels, and per region a
// panel of the image, mask and tinted crops. Everything here is a pure function from buffers to buffers or to PNG
// bytes; publishing the bytes is the pipeline's job.

use crate::core_modules::defect_fusion::{DefectMap, MASK_ON};
use crate::core_modules::imaging::{ScalarMap, crop_gray, crop_rgb};
use crate::core_modules::regions::RegionSet;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, GrayImage, ImageEncoder, ImageError, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

/// Blue -> cyan -> yellow -> orange -> red.
const HEAT_RAMP: [(f32, [u8; 3]); 5] = [
    (0.0, [20, 30, 140]),
    (0.25, [0, 150, 200]),
    (0.5, [250, 220, 40]),
    (0.75, [250, 140, 20]),
    (1.0, [215, 25, 30]),
];

const CRITICAL_OUTLINE: Rgb<u8> = Rgb([255, 200, 0]);
const SURFACE_OUTLINE: Rgb<u8> = Rgb([0, 220, 90]);
const DEFECT_TINT: [u8; 3] = [255, 0, 0];
const TINT_ALPHA: f32 = 0.5;

pub fn encode_png_gray(image: &GrayImage) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::L8)?;
    Ok(bytes)
}

pub fn encode_png_rgb(image: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(bytes)
}

/// Colour for a value in [0, 1]; out-of-range values are clamped.
pub fn heat_color(value: f32) -> Rgb<u8> {
    let x = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    let upper = HEAT_RAMP
        .iter()
        .position(|&(stop, _)| stop >= x)
        .unwrap_or(HEAT_RAMP.len() - 1)
        .max(1);
    let (x0, c0) = HEAT_RAMP[upper - 1];
    let (x1, c1) = HEAT_RAMP[upper];
    let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
    let lerp = |a: u8, b: u8| (a as f32 + t * (b as f32 - a as f32)).round() as u8;
    Rgb([lerp(c0[0], c1[0]), lerp(c0[1], c1[1]), lerp(c0[2], c1[2])])
}

pub fn render_heatmap(intensity: &ScalarMap) -> RgbImage {
    RgbImage::from_fn(intensity.width(), intensity.height(), |x, y| heat_color(intensity.get(x, y)))
}

/// The reference frame with masked pixels tinted red. A mask of another size
/// leaves the frame untouched.
pub fn render_defect_tint(reference: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut tinted = reference.clone();
    if mask.dimensions() != reference.dimensions() {
        return tinted;
    }
    for (pixel, m) in tinted.pixels_mut().zip(mask.pixels()) {
        if m[0] >= MASK_ON {
            for (channel, tint) in pixel.0.iter_mut().zip(DEFECT_TINT) {
                *channel = ((1.0 - TINT_ALPHA) * *channel as f32 + TINT_ALPHA * tint as f32).round() as u8;
            }
        }
    }
    tinted
}

/// The tinted reference frame with every region outlined.
pub fn render_region_overlay(reference: &RgbImage, defects: &DefectMap, regions: &RegionSet) -> RgbImage {
    let mut overlay = render_defect_tint(reference, &defects.mask);
    let (w, h) = reference.dimensions();
    for region in regions.definitions() {
        let b = region.pixel_box(w, h);
        let color = if region.critical { CRITICAL_OUTLINE } else { SURFACE_OUTLINE };
        draw_hollow_rect_mut(&mut overlay, Rect::at(b.x as i32, b.y as i32).of_size(b.width, b.height), color);
    }
    overlay
}

/// What a grader sees of one region.
pub struct RegionPanel {
    pub name: String,
    pub image: RgbImage,
    pub mask: GrayImage,
    pub overlay: RgbImage,
}

/// One panel per region, in layout order.
pub fn region_panels(reference: &RgbImage, defects: &DefectMap, regions: &RegionSet) -> Vec<RegionPanel> {
    let (w, h) = reference.dimensions();
    let tinted = render_defect_tint(reference, &defects.mask);
    regions
        .definitions()
        .into_iter()
        .map(|region| {
            let rect = region.pixel_box(w, h);
            RegionPanel {
                name: region.name.to_string(),
                image: crop_rgb(reference, rect),
                mask: crop_gray(&defects.mask, rect),
                overlay: crop_rgb(&tinted, rect),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FusionConfig, ItemType};
    use crate::core_modules::defect_fusion::DefectFusionEngine;

    #[test]
    fn test_heat_ramp_endpoints_and_clamping() {
        assert_eq!(heat_color(0.0), Rgb([20, 30, 140]));
        assert_eq!(heat_color(0.5), Rgb([250, 220, 40]));
        assert_eq!(heat_color(1.0), Rgb([215, 25, 30]));
        assert_eq!(heat_color(7.0), heat_color(1.0));
        assert_eq!(heat_color(-1.0), heat_color(0.0));
        assert_eq!(heat_color(f32::NAN), heat_color(0.0));
    }

    #[test]
    fn test_png_encoding_round_trips_dimensions() {
        let mask = GrayImage::from_fn(12, 7, |x, _| image::Luma([if x > 5 { 255 } else { 0 }]));
        let bytes = encode_png_gray(&mask).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_luma8();
        assert_eq!(decoded, mask);

        let rgb = RgbImage::from_pixel(9, 4, Rgb([1, 2, 3]));
        let decoded = image::load_from_memory(&encode_png_rgb(&rgb).unwrap()).unwrap().to_rgb8();
        assert_eq!(decoded, rgb);
    }

    #[test]
    fn test_overlay_tints_defects_and_crops_follow_layout() {
        let reference = RgbImage::from_fn(120, 160, |x, y| {
            if x == 60 && y > 40 && y < 120 { Rgb([0, 0, 0]) } else { Rgb([200, 200, 200]) }
        });
        let defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&reference]).unwrap();
        let regions = RegionSet::Named(ItemType::Comic);

        let overlay = render_region_overlay(&reference, &defects, &regions);
        assert_eq!(overlay.dimensions(), reference.dimensions());
        let tinted = overlay
            .pixels()
            .zip(defects.mask.pixels())
            .find(|(_, m)| m[0] == MASK_ON)
            .map(|(p, _)| *p)
            .unwrap();
        assert!(tinted[0] > tinted[1]);

        let panels = region_panels(&reference, &defects, &regions);
        assert_eq!(panels.len(), regions.definitions().len());
        assert_eq!(panels[0].name, "spine");
        for panel in &panels {
            assert!(panel.image.width() > 0 && panel.image.height() > 0);
            assert_eq!(panel.mask.dimensions(), panel.image.dimensions());
            assert_eq!(panel.overlay.dimensions(), panel.image.dimensions());
        }
    }

    #[test]
    fn test_region_panels_cut_mask_and_tint_from_the_same_box() {
        let reference = RgbImage::from_pixel(100, 100, Rgb([200, 200, 200]));
        let mut defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&reference]).unwrap();
        // Damage only in the top-left quarter.
        defects.mask = GrayImage::from_fn(100, 100, |x, y| image::Luma([if x < 50 && y < 50 { MASK_ON } else { 0 }]));
        let regions = RegionSet::FrameRelative;

        let (w, h) = reference.dimensions();
        for (panel, region) in region_panels(&reference, &defects, &regions).iter().zip(regions.definitions()) {
            let rect = region.pixel_box(w, h);
            for (x, y, m) in panel.mask.enumerate_pixels() {
                let damaged = rect.x + x < 50 && rect.y + y < 50;
                assert_eq!(m[0] == MASK_ON, damaged, "{} at ({x}, {y})", panel.name);
                let tinted = panel.overlay.get_pixel(x, y);
                assert_eq!(tinted[0] > tinted[1], damaged);
                assert_eq!(panel.image.get_pixel(x, y), reference.get_pixel(rect.x + x, rect.y + y));
            }
        }
    }

    #[test]
    fn test_heatmap_matches_intensity_size() {
        let intensity = ScalarMap::from_vec(3, 2, vec![0.0, 0.5, 1.0, 0.25, 0.75, 0.0]).unwrap();
        let heat = render_heatmap(&intensity);
        assert_eq!(heat.dimensions(), (3, 2));
        assert_eq!(*heat.get_pixel(2, 0), heat_color(1.0));
    }
}
