// THEORY:
// A region is a named, fractional sub-rectangle of the photographed item. Two
// layouts exist:
//
// - **Named** layouts are object-relative and describe the anatomy of a flat
//   collectible: the spine and the four corners are structurally decisive
//   (critical) and weighted above the cosmetic surface.
// - **Frame-relative** layouts are four border bands plus a centre. They are
//   used whenever the item could not be localized (the fractions then refer to
//   the whole frame, so anatomy names would be a lie) and for
//   three-dimensional items, which have no spine or corners.
//
// Which layout is active is decided once per run from the item type and the
// localization outcome, and carried alongside the frame data as a tagged
// variant.

use crate::config::ItemType;
use crate::core_modules::imaging::PixelBox;
use crate::core_modules::object_localizer::Localization;
use serde::Serialize;

const CORNER_W: f64 = 0.15;
const CORNER_H: f64 = 0.12;
const BAND: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionDefinition {
    pub name: &'static str,
    /// `(x0, y0, x1, y1)`, each in [0, 1].
    pub bounding_box_fraction: (f64, f64, f64, f64),
    pub weight: f64,
    pub critical: bool,
}

impl RegionDefinition {
    const fn new(name: &'static str, bbox: (f64, f64, f64, f64), weight: f64, critical: bool) -> Self {
        Self {
            name,
            bounding_box_fraction: bbox,
            weight,
            critical,
        }
    }

    /// The region in pixels of a `width x height` image. Never empty for a
    /// non-empty image.
    pub fn pixel_box(&self, width: u32, height: u32) -> PixelBox {
        let (fx0, fy0, fx1, fy1) = self.bounding_box_fraction;
        let x0 = ((fx0.clamp(0.0, 1.0) * width as f64).floor() as u32).min(width.saturating_sub(1));
        let y0 = ((fy0.clamp(0.0, 1.0) * height as f64).floor() as u32).min(height.saturating_sub(1));
        let x1 = ((fx1.clamp(0.0, 1.0) * width as f64).ceil() as u32).clamp(x0 + 1, width.max(1));
        let y1 = ((fy1.clamp(0.0, 1.0) * height as f64).ceil() as u32).clamp(y0 + 1, height.max(1));
        PixelBox::new(x0, y0, x1 - x0, y1 - y0)
    }
}

fn corners() -> [RegionDefinition; 4] {
    [
        RegionDefinition::new("top_left_corner", (0.0, 0.0, CORNER_W, CORNER_H), 1.5, true),
        RegionDefinition::new("top_right_corner", (1.0 - CORNER_W, 0.0, 1.0, CORNER_H), 1.5, true),
        RegionDefinition::new("bottom_left_corner", (0.0, 1.0 - CORNER_H, CORNER_W, 1.0), 1.5, true),
        RegionDefinition::new("bottom_right_corner", (1.0 - CORNER_W, 1.0 - CORNER_H, 1.0, 1.0), 1.5, true),
    ]
}

fn comic_regions() -> Vec<RegionDefinition> {
    let mut regions = vec![RegionDefinition::new("spine", (0.0, 0.0, 0.08, 1.0), 2.0, true)];
    regions.extend(corners());
    regions.push(RegionDefinition::new("surface", (0.2, 0.2, 0.8, 0.8), 1.0, false));
    regions
}

fn card_regions() -> Vec<RegionDefinition> {
    let mut regions = corners().to_vec();
    regions.push(RegionDefinition::new("surface", (0.15, 0.15, 0.85, 0.85), 1.0, false));
    regions
}

fn frame_relative_regions() -> Vec<RegionDefinition> {
    vec![
        RegionDefinition::new("top", (0.0, 0.0, 1.0, BAND), 1.5, true),
        RegionDefinition::new("bottom", (0.0, 1.0 - BAND, 1.0, 1.0), 1.5, true),
        RegionDefinition::new("left", (0.0, 0.0, BAND, 1.0), 1.5, true),
        RegionDefinition::new("right", (1.0 - BAND, 0.0, 1.0, 1.0), 1.5, true),
        RegionDefinition::new("center", (BAND, BAND, 1.0 - BAND, 1.0 - BAND), 1.0, false),
    ]
}

/// The active region layout for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "itemType")]
pub enum RegionSet {
    Named(ItemType),
    FrameRelative,
}

impl RegionSet {
    /// Object-relative anatomy when the item was found and has one, the
    /// frame-relative bands otherwise.
    pub fn select(item_type: ItemType, localization: &Localization) -> Self {
        if localization.is_object() && item_type.is_flat() {
            RegionSet::Named(item_type)
        } else {
            RegionSet::FrameRelative
        }
    }

    pub fn definitions(&self) -> Vec<RegionDefinition> {
        match self {
            RegionSet::Named(ItemType::Comic) => comic_regions(),
            RegionSet::Named(ItemType::Card) => card_regions(),
            RegionSet::Named(_) | RegionSet::FrameRelative => frame_relative_regions(),
        }
    }

    pub fn critical(&self) -> Vec<RegionDefinition> {
        self.definitions().into_iter().filter(|r| r.critical).collect()
    }
}
