// THEORY:
// Every tuning constant of the grader is a named field here with its documented
// default. Successive tuning of the grader only ever moved these numbers
// (motion ceilings, edge thresholds, the k-sigma multiplier), never the stage
// structure, so they belong in configuration rather than in the stage code.
//
// Values are layered: built-in defaults, then an optional file, then
// `GRADER__`-prefixed environment variables (`GRADER__FUSION__K_SIGMA=0.5`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The category of collectible being graded. Picks the motion ceiling and the
/// object-relative region layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    #[default]
    Comic,
    Card,
    Toy,
    Other,
}

impl ItemType {
    /// Lenient tag parsing; unknown tags grade as `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "comic" | "comics" | "comic_book" => ItemType::Comic,
            "card" | "cards" | "trading_card" => ItemType::Card,
            "toy" | "toys" | "figure" => ItemType::Toy,
            _ => ItemType::Other,
        }
    }

    /// Flat items are filmed on a table and tolerate far less motion than
    /// three-dimensional ones turned in the hand.
    pub fn is_flat(&self) -> bool {
        matches!(self, ItemType::Comic | ItemType::Card)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Comic => "comic",
            ItemType::Card => "card",
            ItemType::Toy => "toy",
            ItemType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub scheduler: SchedulerConfig,
    pub scoring: ScoringConfig,
    pub selection: SelectionConfig,
    pub alignment: AlignmentConfig,
    pub localization: LocalizationConfig,
    pub fusion: FusionConfig,
    pub regions: RegionConfig,
    pub classifier: ClassifierConfig,
    pub timeouts: TimeoutConfig,
    pub storage: StorageConfig,
}

impl GraderConfig {
    /// Layers an optional config file and `GRADER__*` environment variables
    /// over the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("GRADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Motion ceiling for the item's handling profile.
    pub fn motion_threshold(&self, item_type: ItemType) -> f64 {
        if item_type.is_flat() {
            self.scoring.motion_threshold_flat
        } else {
            self.scoring.motion_threshold_handheld
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_frames_per_chunk: usize,
    pub max_workers: usize,
    /// Attempts at opening the staged source before a worker gives up.
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    /// After this a worker stops scoring and returns what it has.
    pub worker_deadline_secs: u64,
    /// After this a worker is abandoned and contributes nothing.
    pub worker_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_frames_per_chunk: 30,
            max_workers: num_cpus::get().clamp(1, 8),
            open_attempts: 3,
            open_retry_delay_ms: 250,
            worker_deadline_secs: 120,
            worker_timeout_secs: 180,
        }
    }
}

impl SchedulerConfig {
    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }

    pub fn worker_deadline(&self) -> Duration {
        Duration::from_secs(self.worker_deadline_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub motion_threshold_flat: f64,
    pub motion_threshold_handheld: f64,
    pub flow: FlowConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            motion_threshold_flat: 1.0,
            motion_threshold_handheld: 3.0,
            flow: FlowConfig::default(),
        }
    }
}

/// Dense optical flow parameters. The window is expressed at full
/// resolution and scaled down with the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub working_width: u32,
    pub pyramid_levels: u32,
    pub window_size: u32,
    pub iterations: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            working_width: 320,
            pyramid_levels: 3,
            window_size: 15,
            iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub golden_frame_count: usize,
    pub min_frame_gap: usize,
    /// Rank by critical-region visibility when a classifier is attached.
    pub use_visibility: bool,
    pub visibility_top_m: usize,
    pub visibility_function_id: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            golden_frame_count: 5,
            min_frame_gap: 15,
            use_visibility: false,
            visibility_top_m: 20,
            visibility_function_id: "region-visibility".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub enabled: bool,
    pub fast_threshold: u8,
    pub max_keypoints: usize,
    pub max_matches: usize,
    pub min_matches: usize,
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_threshold: 20,
            max_keypoints: 500,
            max_matches: 50,
            min_matches: 4,
            ransac_threshold: 5.0,
            ransac_iterations: 1000,
            min_inliers: 4,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizerMode {
    #[default]
    BoundingContour,
    Quadrilateral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    pub enabled: bool,
    pub mode: LocalizerMode,
    pub min_area_fraction: f64,
    pub quad_min_area_fraction: f64,
    pub padding_fraction: f64,
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub dilate_iterations: u32,
    /// Polygon approximation tolerance as a fraction of the contour perimeter.
    pub quad_epsilon_fraction: f64,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: LocalizerMode::BoundingContour,
            min_area_fraction: 0.30,
            quad_min_area_fraction: 0.10,
            padding_fraction: 0.05,
            blur_sigma: 1.5,
            canny_low: 50.0,
            canny_high: 150.0,
            dilate_iterations: 2,
            quad_epsilon_fraction: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// (low, high) Canny thresholds for the fine, medium and strong passes.
    pub edge_thresholds: [(f32, f32); 3],
    pub edge_weights: [f32; 3],
    /// Weights of edges, |Laplacian|, gradient magnitude and local std.
    pub component_weights: [f32; 4],
    pub local_std_window: u32,
    pub variance_weight: f32,
    pub k_sigma: f32,
    /// Chebyshev radius of the square closing element (1 is 3x3).
    pub close_radius: u8,
    pub close_iterations: u32,
    /// Weight of the pairwise max-difference map; 0 leaves it out of the blend.
    pub max_difference_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            edge_thresholds: [(15.0, 60.0), (30.0, 100.0), (50.0, 150.0)],
            edge_weights: [0.5, 0.35, 0.15],
            component_weights: [0.45, 0.25, 0.20, 0.10],
            local_std_window: 5,
            variance_weight: 0.25,
            k_sigma: 0.3,
            close_radius: 1,
            close_iterations: 1,
            max_difference_weight: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Weights of coverage, mean intensity and edge density in the region score.
    pub score_weights: [f64; 3],
    pub edge_canny_low: f32,
    pub edge_canny_high: f32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            score_weights: [0.4, 0.3, 0.3],
            edge_canny_low: 30.0,
            edge_canny_high: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Grade regions with the external classifier when one is attached.
    pub grade_regions: bool,
    pub grade_function_id: String,
    pub confidence_floor: f64,
    pub neutral_grade: f64,
    pub call_timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            grade_regions: false,
            grade_function_id: "condition-grade".to_string(),
            confidence_floor: 0.30,
            neutral_grade: 5.0,
            call_timeout_secs: 20,
        }
    }
}

impl ClassifierConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub job_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { job_secs: 600 }
    }
}

impl TimeoutConfig {
    pub fn job_budget(&self) -> Duration {
        Duration::from_secs(self.job_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "condition-vision-artifacts".to_string(),
            prefix: "jobs".to_string(),
        }
    }
}
