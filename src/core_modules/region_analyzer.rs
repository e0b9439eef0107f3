// THEORY:
// The region analyzer turns the fused defect map into condition scores for the
// named parts of the item, and those into one weighted grade.
//
// Two grading strategies exist and one is chosen per run:
//
// - **Variance analysis** (always available): for each region the defect
//   coverage, the mean fused intensity and an independent edge density are
//   combined into a 0..100 damage score (0 = pristine), which maps linearly
//   onto the 0..10 grade scale.
// - **Classifier grading**: each region crop is sent to the external
//   classifier, and its condition label maps to a fixed grade. A label given
//   with low confidence is not trusted; the region gets the neutral grade
//   instead. Any classifier error abandons the strategy for the whole run and
//   falls back to variance analysis, so a report never mixes the two.
//
// Aggregation is always a weighted average, never a plain mean: structural
// regions (spine, corners) outweigh the cosmetic surface. A second aggregate
// over the critical regions alone is reported next to the overall one because
// it is usually the binding constraint on the headline grade.

use crate::collaborators::classifier::VisualClassifier;
use crate::config::{ClassifierConfig, RegionConfig};
use crate::core_modules::defect_fusion::{DefectMap, MASK_ON};
use crate::core_modules::grade_quantizer::grade_quantizer::quantize_grade;
use crate::core_modules::imaging::{self, crop_rgb, to_gray};
use crate::core_modules::regions::{RegionDefinition, RegionSet};
use crate::error::ClassifierError;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Condition labels understood from the classifier, best first, with the
/// grade each stands for.
pub const CONDITION_GRADES: [(&str, f64); 6] = [
    ("pristine", 10.0),
    ("near_mint", 9.2),
    ("minor_wear", 7.5),
    ("moderate_wear", 5.5),
    ("heavy_wear", 3.5),
    ("damaged", 1.5),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMethod {
    Variance,
    Classifier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionScore {
    pub region_name: String,
    pub weight: f64,
    pub critical: bool,
    pub defect_coverage_percent: f64,
    /// Mean fused intensity, x100.
    pub mean_intensity: f64,
    /// Max fused intensity, x100.
    pub max_intensity: f64,
    pub edge_density: f64,
    /// 0 = pristine, 100 = fully damaged.
    pub quality_score: f64,
    /// On the 0..10 grade scale (not yet quantized).
    pub grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Weighted damage score in [0, 100].
    pub overall_damage_score: f64,
    pub weighted_grade: f64,
    pub quantized_grade: f64,
    pub critical_grade: Option<f64>,
    pub lowest_scoring_region: String,
    pub grading_method: GradingMethod,
    pub per_region_scores: Vec<RegionScore>,
}

/// `Σ(value × weight) / Σ(weight)`. `None` when the weights sum to zero.
pub fn weighted_average(values: &[(f64, f64)]) -> Option<f64> {
    let total_weight: f64 = values.iter().map(|&(_, w)| w).sum();
    if total_weight <= 0.0 {
        return None;
    }
    Some(values.iter().map(|&(v, w)| v * w).sum::<f64>() / total_weight)
}

/// Damage score (0..100) to grade (10..0).
pub fn grade_from_score(score: f64) -> f64 {
    (10.0 - score.clamp(0.0, 100.0) / 10.0).clamp(0.0, 10.0)
}

/// The grade a classifier label stands for, or the neutral grade when the
/// confidence is below the floor or the label is unknown.
pub fn grade_from_label(label: &str, confidence: f64, floor: f64, neutral: f64) -> f64 {
    if !(confidence >= floor) {
        return neutral;
    }
    let label = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    CONDITION_GRADES
        .iter()
        .find(|(name, _)| *name == label)
        .map(|&(_, grade)| grade)
        .unwrap_or(neutral)
}

/// How regions are graded for one run.
#[derive(Clone)]
pub enum RegionGrading {
    Variance,
    Classifier {
        classifier: Arc<dyn VisualClassifier>,
        function_id: String,
        confidence_floor: f64,
        neutral_grade: f64,
        call_timeout: Duration,
    },
}

impl RegionGrading {
    /// Classifier grading when enabled and a classifier is attached.
    pub fn resolve(config: &ClassifierConfig, classifier: Option<Arc<dyn VisualClassifier>>) -> Self {
        match classifier {
            Some(classifier) if config.grade_regions => RegionGrading::Classifier {
                classifier,
                function_id: config.grade_function_id.clone(),
                confidence_floor: config.confidence_floor,
                neutral_grade: config.neutral_grade,
                call_timeout: config.call_timeout(),
            },
            _ => RegionGrading::Variance,
        }
    }
}

pub struct RegionAnalyzer {
    config: RegionConfig,
}

impl RegionAnalyzer {
    pub fn new(config: RegionConfig) -> Self {
        Self { config }
    }

    /// Variance analysis of every region of `regions`.
    pub fn analyze(&self, reference: &RgbImage, defects: &DefectMap, regions: &RegionSet) -> Vec<RegionScore> {
        let (w, h) = defects.dimensions();
        let edges = imaging::canny(&to_gray(reference), self.config.edge_canny_low, self.config.edge_canny_high);
        let [w_cov, w_mean, w_edge] = self.config.score_weights;

        regions
            .definitions()
            .iter()
            .map(|region| {
                let rect = region.pixel_box(w, h);
                let pixels = rect.area().max(1) as f64;
                let intensity = defects.intensity.crop(rect);
                let mask = imaging::crop_gray(&defects.mask, rect);
                let region_edges = edges.crop(rect);

                let lit = mask.as_raw().iter().filter(|&&v| v >= MASK_ON).count() as f64;
                let defect_coverage_percent = lit * 100.0 / pixels;
                let (mean, _) = intensity.mean_std();
                let mean_intensity = mean * 100.0;
                let max_intensity = intensity.max() as f64 * 100.0;
                let edge_density = region_edges.data().iter().filter(|&&v| v > 0.0).count() as f64 * 100.0 / pixels;

                let quality_score =
                    (w_cov * defect_coverage_percent + w_mean * mean_intensity + w_edge * edge_density).clamp(0.0, 100.0);
                RegionScore {
                    region_name: region.name.to_string(),
                    weight: region.weight,
                    critical: region.critical,
                    defect_coverage_percent,
                    mean_intensity,
                    max_intensity,
                    edge_density,
                    quality_score,
                    grade: grade_from_score(quality_score),
                    classifier_label: None,
                    classifier_confidence: None,
                }
            })
            .collect()
    }

    async fn classify_regions(
        &self,
        reference: &RgbImage,
        regions: &[RegionDefinition],
        scores: &mut [RegionScore],
        grading: &RegionGrading,
    ) -> Result<(), ClassifierError> {
        let RegionGrading::Classifier {
            classifier,
            function_id,
            confidence_floor,
            neutral_grade,
            call_timeout,
        } = grading
        else {
            return Ok(());
        };
        let (w, h) = reference.dimensions();
        for (region, score) in regions.iter().zip(scores.iter_mut()) {
            let crop = crop_rgb(reference, region.pixel_box(w, h));
            let classification = tokio::time::timeout(*call_timeout, classifier.classify(&crop, function_id))
                .await
                .map_err(|_| ClassifierError::Timeout(*call_timeout))??;
            let grade = grade_from_label(&classification.label, classification.confidence, *confidence_floor, *neutral_grade);
            if classification.confidence < *confidence_floor {
                debug!(
                    region = region.name,
                    confidence = classification.confidence,
                    "Low-confidence classification replaced by neutral grade"
                );
            }
            score.grade = grade;
            score.quality_score = ((10.0 - grade) * 10.0).clamp(0.0, 100.0);
            score.classifier_label = Some(classification.label);
            score.classifier_confidence = Some(classification.confidence);
        }
        Ok(())
    }

    /// Grades the regions with the run's strategy. Variance statistics are
    /// always computed; the classifier, when used, only replaces the grades.
    pub async fn grade(
        &self,
        reference: &RgbImage,
        defects: &DefectMap,
        regions: &RegionSet,
        grading: &RegionGrading,
    ) -> (Vec<RegionScore>, GradingMethod) {
        let variance = self.analyze(reference, defects, regions);
        if matches!(grading, RegionGrading::Variance) {
            return (variance, GradingMethod::Variance);
        }
        let mut classified = variance.clone();
        match self
            .classify_regions(reference, &regions.definitions(), &mut classified, grading)
            .await
        {
            Ok(()) => (classified, GradingMethod::Classifier),
            Err(e) => {
                warn!(error = %e, "Region classifier unavailable, falling back to variance analysis");
                (variance, GradingMethod::Variance)
            }
        }
    }
}

/// Weighted overall and critical aggregates. `None` without any weighted region.
pub fn aggregate(scores: Vec<RegionScore>, method: GradingMethod) -> Option<AggregateResult> {
    let overall_damage_score =
        weighted_average(&scores.iter().map(|s| (s.quality_score, s.weight)).collect::<Vec<_>>())?;
    let weighted_grade = weighted_average(&scores.iter().map(|s| (s.grade, s.weight)).collect::<Vec<_>>())?;
    let critical_grade = weighted_average(
        &scores
            .iter()
            .filter(|s| s.critical)
            .map(|s| (s.grade, s.weight))
            .collect::<Vec<_>>(),
    );
    let lowest_scoring_region = scores
        .iter()
        .min_by(|a, b| a.grade.total_cmp(&b.grade))
        .map(|s| s.region_name.clone())?;

    Some(AggregateResult {
        overall_damage_score: overall_damage_score.clamp(0.0, 100.0),
        weighted_grade,
        quantized_grade: quantize_grade(weighted_grade),
        critical_grade,
        lowest_scoring_region,
        grading_method: method,
        per_region_scores: scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::classifier::Classification;
    use crate::config::{FusionConfig, ItemType};
    use crate::core_modules::defect_fusion::DefectFusionEngine;
    use async_trait::async_trait;
    use image::Rgb;

    fn score(name: &str, grade: f64, weight: f64, critical: bool) -> RegionScore {
        RegionScore {
            region_name: name.to_string(),
            weight,
            critical,
            defect_coverage_percent: 0.0,
            mean_intensity: 0.0,
            max_intensity: 0.0,
            edge_density: 0.0,
            quality_score: (10.0 - grade) * 10.0,
            grade,
            classifier_label: None,
            classifier_confidence: None,
        }
    }

    #[test]
    fn test_weighted_average_is_not_a_plain_mean() {
        let avg = weighted_average(&[(10.0, 1.0), (10.0, 1.0), (0.0, 2.0)]).unwrap();
        assert!((avg - 5.0).abs() < 1e-12);
        assert_eq!(weighted_average(&[]), None);
        assert_eq!(weighted_average(&[(3.0, 0.0)]), None);
    }

    #[test]
    fn test_low_confidence_label_is_replaced_by_neutral_grade() {
        assert_eq!(grade_from_label("pristine", 0.20, 0.30, 5.0), 5.0);
        assert_eq!(grade_from_label("pristine", 0.90, 0.30, 5.0), 10.0);
        assert_eq!(grade_from_label("Heavy Wear", 0.90, 0.30, 5.0), 3.5);
        assert_eq!(grade_from_label("sparkly", 0.99, 0.30, 5.0), 5.0);
        assert_eq!(grade_from_label("damaged", f64::NAN, 0.30, 5.0), 5.0);
    }

    #[test]
    fn test_aggregate_reports_critical_and_lowest_region() {
        let result = aggregate(
            vec![
                score("spine", 4.0, 2.0, true),
                score("top_left_corner", 9.0, 1.5, true),
                score("surface", 9.5, 1.0, false),
            ],
            GradingMethod::Variance,
        )
        .unwrap();
        let expected_critical = (4.0 * 2.0 + 9.0 * 1.5) / 3.5;
        assert!((result.critical_grade.unwrap() - expected_critical).abs() < 1e-12);
        assert_eq!(result.lowest_scoring_region, "spine");
        assert!(result.quantized_grade <= result.weighted_grade);
        assert!(aggregate(Vec::new(), GradingMethod::Variance).is_none());
    }

    fn damaged_spine_item(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let scratched = x < w / 14 && (y % 7 < 2 || (x + y) % 9 == 0);
            if scratched { Rgb([40, 35, 30]) } else { Rgb([205, 200, 190]) }
        })
    }

    #[test]
    fn test_damaged_spine_grades_below_surface() {
        let item = damaged_spine_item(200, 300);
        let defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&item]).unwrap();
        let scores = RegionAnalyzer::new(RegionConfig::default()).analyze(
            &item,
            &defects,
            &RegionSet::Named(ItemType::Comic),
        );
        let spine = scores.iter().find(|s| s.region_name == "spine").unwrap();
        let surface = scores.iter().find(|s| s.region_name == "surface").unwrap();
        assert!(spine.grade < surface.grade);
        assert!(spine.defect_coverage_percent > surface.defect_coverage_percent);
        assert!(scores.iter().all(|s| (0.0..=100.0).contains(&s.quality_score)));
    }

    struct FixedClassifier(Result<Classification, ()>);

    #[async_trait]
    impl VisualClassifier for FixedClassifier {
        async fn classify(&self, _image: &RgbImage, _function_id: &str) -> Result<Classification, ClassifierError> {
            self.0.clone().map_err(|_| ClassifierError::Unavailable("down".into()))
        }
    }

    fn classifier_grading(classifier: FixedClassifier) -> RegionGrading {
        RegionGrading::Classifier {
            classifier: Arc::new(classifier),
            function_id: "condition-grade".into(),
            confidence_floor: 0.30,
            neutral_grade: 5.0,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_classifier_grades_replace_variance_grades() {
        let item = damaged_spine_item(100, 150);
        let defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&item]).unwrap();
        let analyzer = RegionAnalyzer::new(RegionConfig::default());
        let grading = classifier_grading(FixedClassifier(Ok(Classification::new("near_mint", 0.8))));
        let (scores, method) = analyzer
            .grade(&item, &defects, &RegionSet::Named(ItemType::Comic), &grading)
            .await;
        assert_eq!(method, GradingMethod::Classifier);
        assert!(scores.iter().all(|s| s.grade == 9.2));
        assert_eq!(scores[0].classifier_label.as_deref(), Some("near_mint"));
    }

    #[tokio::test]
    async fn test_low_confidence_classifier_yields_neutral_grades() {
        let item = damaged_spine_item(100, 150);
        let defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&item]).unwrap();
        let analyzer = RegionAnalyzer::new(RegionConfig::default());
        let grading = classifier_grading(FixedClassifier(Ok(Classification::new("pristine", 0.20))));
        let (scores, _) = analyzer
            .grade(&item, &defects, &RegionSet::FrameRelative, &grading)
            .await;
        assert!(scores.iter().all(|s| s.grade == 5.0));
    }

    #[tokio::test]
    async fn test_classifier_error_falls_back_to_variance() {
        let item = damaged_spine_item(100, 150);
        let defects = DefectFusionEngine::new(FusionConfig::default()).fuse(&[&item]).unwrap();
        let analyzer = RegionAnalyzer::new(RegionConfig::default());
        let expected = analyzer.analyze(&item, &defects, &RegionSet::Named(ItemType::Comic));
        let grading = classifier_grading(FixedClassifier(Err(())));
        let (scores, method) = analyzer
            .grade(&item, &defects, &RegionSet::Named(ItemType::Comic), &grading)
            .await;
        assert_eq!(method, GradingMethod::Variance);
        assert_eq!(scores, expected);
    }
}
