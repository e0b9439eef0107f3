// THEORY:
// The golden frame selector picks the few frames every later stage works on.
// It sees only the candidate list (index, sharpness, motion, timestamp), never
// pixels, unless the visibility strategy is active.
//
// Key architectural principles:
// 1.  **Greedy spacing**: candidates are walked in rank order and a candidate
//     is accepted only if its index is at least `min_gap` away from every frame
//     already accepted. Near-duplicate neighbours of the sharpest frame carry
//     no new lighting information for fusion.
// 2.  **Strategy chosen once**: a run either ranks by sharpness or by
//     critical-region visibility. Visibility asks the external classifier
//     whether each critical region is clearly visible in each of the sharpest
//     `top_m` frames. The classifier is never trusted to answer: any error or
//     timeout drops the whole run back to sharpness ranking, and the outcome
//     records why.
// 3.  **Zero is an error, few is not**: fewer candidates than requested just
//     returns all of them; an empty list is the one case that cannot go on.

use crate::collaborators::classifier::VisualClassifier;
use crate::collaborators::source::VideoSource;
use crate::config::{ClassifierConfig, SelectionConfig};
use crate::core_modules::frame::FrameCandidate;
use crate::core_modules::imaging::crop_rgb;
use crate::core_modules::regions::{RegionDefinition, RegionSet};
use crate::error::{ClassifierError, SelectionError};
use image::RgbImage;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const VISIBLE_LABEL: &str = "clearly_visible";

fn by_sharpness(a: &FrameCandidate, b: &FrameCandidate) -> Ordering {
    b.sharpness
        .total_cmp(&a.sharpness)
        .then(a.frame_index.cmp(&b.frame_index))
}

fn accept_spaced(ranked: impl IntoIterator<Item = FrameCandidate>, count: usize, min_gap: usize) -> Vec<FrameCandidate> {
    let mut accepted: Vec<FrameCandidate> = Vec::with_capacity(count);
    for candidate in ranked {
        if accepted.len() >= count {
            break;
        }
        let spaced = accepted
            .iter()
            .all(|a| a.frame_index.abs_diff(candidate.frame_index) >= min_gap);
        if spaced {
            accepted.push(candidate);
        }
    }
    accepted
}

/// Sharpest-first greedy selection of up to `count` frames at least `min_gap`
/// indices apart.
pub fn select_golden_frames(candidates: &[FrameCandidate], count: usize, min_gap: usize) -> Vec<FrameCandidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(by_sharpness);
    accept_spaced(ranked, count, min_gap)
}

#[derive(Clone)]
pub enum SelectionStrategy {
    Sharpness,
    Visibility {
        classifier: Arc<dyn VisualClassifier>,
        function_id: String,
        top_m: usize,
        call_timeout: Duration,
    },
}

impl SelectionStrategy {
    pub fn resolve(
        selection: &SelectionConfig,
        classifier_config: &ClassifierConfig,
        classifier: Option<Arc<dyn VisualClassifier>>,
    ) -> Self {
        match classifier {
            Some(classifier) if selection.use_visibility => SelectionStrategy::Visibility {
                classifier,
                function_id: selection.visibility_function_id.clone(),
                top_m: selection.visibility_top_m,
                call_timeout: classifier_config.call_timeout(),
            },
            _ => SelectionStrategy::Sharpness,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Sharpness,
    Visibility,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionOutcome {
    /// In rank order; the first frame is the alignment reference.
    pub frames: Vec<FrameCandidate>,
    pub method: SelectionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum VisibilityError {
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("failed to read candidate frames: {0}")]
    Source(String),
}

pub struct GoldenFrameSelector {
    count: usize,
    min_gap: usize,
    regions: RegionSet,
}

impl GoldenFrameSelector {
    /// `regions` supplies the critical regions the visibility strategy checks.
    pub fn new(config: &SelectionConfig, regions: RegionSet) -> Self {
        Self {
            count: config.golden_frame_count,
            min_gap: config.min_frame_gap,
            regions,
        }
    }

    pub async fn select(
        &self,
        candidates: &[FrameCandidate],
        strategy: &SelectionStrategy,
        source: Arc<dyn VideoSource>,
    ) -> Result<SelectionOutcome, SelectionError> {
        if candidates.is_empty() {
            return Err(SelectionError::NoCandidates);
        }
        let SelectionStrategy::Visibility {
            classifier,
            function_id,
            top_m,
            call_timeout,
        } = strategy
        else {
            return Ok(self.sharpness_outcome(candidates, None));
        };

        match self
            .rank_by_visibility(candidates, classifier.as_ref(), function_id, *top_m, *call_timeout, source)
            .await
        {
            Ok(ranked) => Ok(SelectionOutcome {
                frames: accept_spaced(ranked, self.count, self.min_gap),
                method: SelectionMethod::Visibility,
                fallback_reason: None,
            }),
            Err(e) => {
                warn!(error = %e, "Visibility ranking failed, falling back to sharpness ranking");
                Ok(self.sharpness_outcome(candidates, Some(e.to_string())))
            }
        }
    }

    fn sharpness_outcome(&self, candidates: &[FrameCandidate], fallback_reason: Option<String>) -> SelectionOutcome {
        SelectionOutcome {
            frames: select_golden_frames(candidates, self.count, self.min_gap),
            method: SelectionMethod::Sharpness,
            fallback_reason,
        }
    }

    /// The top `top_m` candidates re-ranked by (visibility, sharpness), then
    /// the remaining candidates by sharpness.
    async fn rank_by_visibility(
        &self,
        candidates: &[FrameCandidate],
        classifier: &dyn VisualClassifier,
        function_id: &str,
        top_m: usize,
        call_timeout: Duration,
        source: Arc<dyn VideoSource>,
    ) -> Result<Vec<FrameCandidate>, VisibilityError> {
        let mut ranked = candidates.to_vec();
        ranked.sort_by(by_sharpness);
        let rest = ranked.split_off(top_m.min(ranked.len()));

        let indices: Vec<usize> = ranked.iter().map(|c| c.frame_index).collect();
        let frames = tokio::task::spawn_blocking(move || -> Result<Vec<RgbImage>, String> {
            let mut reader = source.open().map_err(|e| e.to_string())?;
            indices
                .into_iter()
                .map(|index| reader.read_frame(index).map_err(|e| e.to_string()))
                .collect()
        })
        .await
        .map_err(|e| VisibilityError::Source(e.to_string()))?
        .map_err(VisibilityError::Source)?;

        let critical = self.regions.critical();
        let mut scored = Vec::with_capacity(ranked.len());
        for (candidate, frame) in ranked.into_iter().zip(frames) {
            let visibility = visibility_score(&frame, &critical, classifier, function_id, call_timeout).await?;
            debug!(frame = candidate.frame_index, visibility, "Visibility scored");
            scored.push((visibility, candidate));
        }
        scored.sort_by(|(va, a), (vb, b)| vb.total_cmp(va).then_with(|| by_sharpness(a, b)));

        Ok(scored.into_iter().map(|(_, c)| c).chain(rest).collect())
    }
}

/// Number of critical regions labelled clearly visible plus the mean
/// confidence over all critical regions.
async fn visibility_score(
    frame: &RgbImage,
    critical: &[RegionDefinition],
    classifier: &dyn VisualClassifier,
    function_id: &str,
    call_timeout: Duration,
) -> Result<f64, ClassifierError> {
    if critical.is_empty() {
        return Ok(0.0);
    }
    let (w, h) = frame.dimensions();
    let mut visible = 0usize;
    let mut confidence = 0.0;
    for region in critical {
        let crop = crop_rgb(frame, region.pixel_box(w, h));
        let result = tokio::time::timeout(call_timeout, classifier.classify(&crop, function_id))
            .await
            .map_err(|_| ClassifierError::Timeout(call_timeout))??;
        if result.label == VISIBLE_LABEL {
            visible += 1;
        }
        confidence += result.confidence.clamp(0.0, 1.0);
    }
    Ok(visible as f64 + confidence / critical.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::classifier::Classification;
    use crate::collaborators::source::InMemorySource;
    use crate::config::ItemType;
    use async_trait::async_trait;
    use image::Rgb;

    fn candidate(frame_index: usize, sharpness: f64) -> FrameCandidate {
        FrameCandidate {
            frame_index,
            sharpness,
            motion: 0.0,
            timestamp_seconds: frame_index as f64 / 30.0,
        }
    }

    fn indices(frames: &[FrameCandidate]) -> Vec<usize> {
        frames.iter().map(|c| c.frame_index).collect()
    }

    #[test]
    fn test_greedy_spacing_skips_neighbours_of_sharper_frames() {
        let candidates = vec![
            candidate(0, 10.0),
            candidate(5, 90.0),
            candidate(12, 80.0),
            candidate(20, 70.0),
            candidate(40, 60.0),
            candidate(41, 95.0),
        ];
        let selected = select_golden_frames(&candidates, 3, 15);
        assert_eq!(indices(&selected), vec![41, 5, 20]);
    }

    #[test]
    fn test_fewer_candidates_than_requested_returns_all() {
        let candidates = vec![candidate(0, 1.0), candidate(30, 2.0)];
        assert_eq!(indices(&select_golden_frames(&candidates, 5, 15)), vec![30, 0]);
        assert!(select_golden_frames(&[], 5, 15).is_empty());
    }

    /// Calls a region visible only in frames whose top-left pixel is bright.
    struct BrightnessVisibility;

    #[async_trait]
    impl VisualClassifier for BrightnessVisibility {
        async fn classify(&self, image: &RgbImage, _function_id: &str) -> Result<Classification, ClassifierError> {
            if image.get_pixel(0, 0)[0] > 128 {
                Ok(Classification::new(VISIBLE_LABEL, 0.9))
            } else {
                Ok(Classification::new("obscured", 0.6))
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl VisualClassifier for Broken {
        async fn classify(&self, _image: &RgbImage, _function_id: &str) -> Result<Classification, ClassifierError> {
            Err(ClassifierError::Unavailable("offline".into()))
        }
    }

    fn source_with_bright_frames(total: usize, bright: &[usize]) -> Arc<dyn VideoSource> {
        let frames = (0..total)
            .map(|i| {
                let v = if bright.contains(&i) { 220 } else { 40 };
                RgbImage::from_pixel(40, 60, Rgb([v, v, v]))
            })
            .collect();
        Arc::new(InMemorySource::new(frames, 30.0))
    }

    fn visibility(classifier: Arc<dyn VisualClassifier>) -> SelectionStrategy {
        SelectionStrategy::Visibility {
            classifier,
            function_id: "region-visibility".into(),
            top_m: 20,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn selector(count: usize) -> GoldenFrameSelector {
        let config = SelectionConfig {
            golden_frame_count: count,
            ..SelectionConfig::default()
        };
        GoldenFrameSelector::new(&config, RegionSet::Named(ItemType::Comic))
    }

    #[tokio::test]
    async fn test_visibility_reranks_before_sharpness() {
        let candidates = vec![candidate(0, 100.0), candidate(20, 90.0), candidate(40, 80.0)];
        let source = source_with_bright_frames(50, &[40]);
        let outcome = selector(2)
            .select(&candidates, &visibility(Arc::new(BrightnessVisibility)), source)
            .await
            .unwrap();
        assert_eq!(outcome.method, SelectionMethod::Visibility);
        assert_eq!(indices(&outcome.frames), vec![40, 0]);
    }

    #[tokio::test]
    async fn test_classifier_error_falls_back_to_sharpness() {
        let candidates = vec![candidate(0, 100.0), candidate(20, 90.0), candidate(40, 80.0)];
        let source = source_with_bright_frames(50, &[40]);
        let outcome = selector(2)
            .select(&candidates, &visibility(Arc::new(Broken)), source)
            .await
            .unwrap();
        assert_eq!(outcome.method, SelectionMethod::Sharpness);
        assert!(outcome.fallback_reason.is_some());
        assert_eq!(indices(&outcome.frames), vec![0, 20]);
    }

    #[tokio::test]
    async fn test_unreadable_frames_fall_back_to_sharpness() {
        let candidates = vec![candidate(0, 100.0), candidate(99, 90.0)];
        let source = source_with_bright_frames(10, &[]);
        let outcome = selector(2)
            .select(&candidates, &visibility(Arc::new(BrightnessVisibility)), source)
            .await
            .unwrap();
        assert_eq!(outcome.method, SelectionMethod::Sharpness);
        assert_eq!(indices(&outcome.frames), vec![0, 99]);
    }

    #[tokio::test]
    async fn test_zero_candidates_is_an_error() {
        let source = source_with_bright_frames(1, &[]);
        let result = selector(5).select(&[], &SelectionStrategy::Sharpness, source).await;
        assert_eq!(result.unwrap_err(), SelectionError::NoCandidates);
    }
}
