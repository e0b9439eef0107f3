// THEORY:
// The `pipeline` module is the top-level API of the grader. It strings the
// stages together for one job: acquire and stage the video, scan every frame
// in parallel, pick the golden frames, locate the item, align, fuse defects,
// grade the regions and publish the artifacts.
//
// Key architectural principles:
// 1.  **Few ways to fail**: only three things end a job with an error: the
//     source cannot be acquired, no stable frame survives the scan, or the job
//     runs out of time. Every other problem (a missing item outline, a frame
//     that will not align, a classifier outage, a failed upload) is absorbed by
//     the stage that hit it and shows up as a degraded field of the report.
//     A panicked blocking stage is a bug, not a condition, and aborts the job.
// 2.  **One geometry**: the item is located once, on the reference frame, and
//     that box is applied to every golden frame. Frames that moved a little
//     are brought back into register by the aligner afterwards.
// 3.  **Blocking work off the runtime**: decoding, alignment and fusion are
//     CPU-bound and run on the blocking pool; the async side only coordinates.
// 4.  **Clean up on every path**: the staged copy of the video is removed when
//     the job ends, whether it succeeded, failed or timed out.

use crate::collaborators::classifier::VisualClassifier;
use crate::collaborators::progress::{ProgressSink, TracingProgressSink};
use crate::collaborators::source::{VideoIngress, VideoSource};
use crate::collaborators::staging::StagingArea;
use crate::collaborators::storage::ObjectStore;
use crate::config::{GraderConfig, ItemType};
use crate::core_modules::defect_fusion::{DefectFusionEngine, DefectMap};
use crate::core_modules::frame::{FrameCandidate, SelectedFrame};
use crate::core_modules::frame_aligner::{AlignedFrame, Alignment, FrameAligner};
use crate::core_modules::frame_selector::{GoldenFrameSelector, SelectionMethod, SelectionStrategy};
use crate::core_modules::object_localizer::{Localization, ObjectLocalizer};
use crate::core_modules::region_analyzer::{AggregateResult, RegionAnalyzer, RegionGrading, aggregate};
use crate::core_modules::regions::RegionSet;
use crate::core_modules::visualization;
use crate::error::{FusionError, PipelineError, SourceError};
use crate::parallel_pipeline::{ChunkScheduler, ScanSummary};
use image::{ImageError, RgbImage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const PNG: &str = "image/png";

/// One grading job.
#[derive(Debug, Clone)]
pub struct GradingRequest {
    /// Locator understood by the configured `VideoIngress`.
    pub source: String,
    pub job_id: String,
    pub item_type: ItemType,
}

impl GradingRequest {
    pub fn new(source: impl Into<String>, job_id: impl Into<String>, item_tag: &str) -> Self {
        Self {
            source: source.into(),
            job_id: job_id.into(),
            item_type: ItemType::from_tag(item_tag),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    pub frame_index: usize,
    pub timestamp_seconds: f64,
    pub sharpness: f64,
    pub motion: f64,
    pub url: Option<String>,
    pub alignment: Alignment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionCrop {
    pub region: String,
    pub url: Option<String>,
    pub mask_url: Option<String>,
    pub overlay_url: Option<String>,
}

/// Published defect artifacts; every URL is `None` when its upload failed.
#[derive(Debug, Clone, Default)]
struct DefectArtifacts {
    mask: Option<String>,
    heatmap: Option<String>,
    overlay: Option<String>,
    max_difference: Option<String>,
    regions: Vec<RegionCrop>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub total_frames: usize,
    pub frames_analyzed: usize,
    pub candidates: usize,
    pub workers: usize,
    pub failed_workers: usize,
    pub truncated_workers: usize,
    pub motion_threshold: f64,
    pub selection_method: SelectionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_fallback: Option<String>,
    pub localization: Localization,
    pub region_set: RegionSet,
    pub frames_fused: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion_error: Option<String>,
    pub elapsed_ms: u128,
}

/// The result of a grading job. URLs are `None` when the upload failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingReport {
    pub job_id: String,
    pub item_type: ItemType,
    pub golden_frames: Vec<Option<String>>,
    pub frame_timestamps: Vec<f64>,
    pub frames: Vec<FrameReport>,
    pub defect_mask: Option<String>,
    pub defect_heatmap: Option<String>,
    pub region_overlay: Option<String>,
    /// Only present when two or more frames were fused.
    pub max_difference_map: Option<String>,
    pub region_crops: Vec<RegionCrop>,
    /// Share of the fused mask flagged as defective, in percent.
    pub defect_percentage: Option<f64>,
    /// `None` when no defect map could be built.
    pub assessment: Option<AggregateResult>,
    pub diagnostics: Diagnostics,
}

/// Critical regions checked by visibility ranking, before the item is located.
fn visibility_regions(item_type: ItemType) -> RegionSet {
    if item_type.is_flat() { RegionSet::Named(item_type) } else { RegionSet::FrameRelative }
}

/// The main, top-level struct of the grader.
pub struct GradingPipeline {
    config: GraderConfig,
    ingress: Arc<dyn VideoIngress>,
    staging: Arc<dyn StagingArea>,
    store: Arc<dyn ObjectStore>,
    classifier: Option<Arc<dyn VisualClassifier>>,
    progress: Arc<dyn ProgressSink>,
}

impl GradingPipeline {
    pub fn new(
        config: GraderConfig,
        ingress: Arc<dyn VideoIngress>,
        staging: Arc<dyn StagingArea>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            ingress,
            staging,
            store,
            classifier: None,
            progress: Arc::new(TracingProgressSink),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn VisualClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// Runs one job within the configured job budget.
    pub async fn run(&self, request: GradingRequest) -> Result<GradingReport, PipelineError> {
        let budget = self.config.timeouts.job_budget();
        info!(job_id = %request.job_id, item_type = request.item_type.as_str(), source = %request.source, "Grading job started");

        let result = match tokio::time::timeout(budget, self.execute(&request)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                job_id: request.job_id.clone(),
                budget,
            }),
        };

        if let Err(e) = self.staging.remove(&request.job_id).await {
            warn!(job_id = %request.job_id, error = %e, "Failed to remove staged source");
        }
        match &result {
            Ok(report) => info!(
                job_id = %request.job_id,
                grade = report.assessment.as_ref().map(|a| a.quantized_grade),
                "Grading job finished"
            ),
            Err(e) => warn!(job_id = %request.job_id, error = %e, "Grading job failed"),
        }
        result
    }

    async fn report_progress(&self, job_id: &str, percent: u8, message: &str, step: &str) {
        if let Err(e) = self.progress.report(job_id, percent, message, step).await {
            warn!(job_id, percent, error = %e, "Progress update dropped");
        }
    }

    async fn execute(&self, request: &GradingRequest) -> Result<GradingReport, PipelineError> {
        let started = Instant::now();
        let job_id = request.job_id.as_str();
        let item_type = request.item_type;

        self.report_progress(job_id, 5, "Fetching source video", "acquire").await;
        let source = self.ingress.fetch(&request.source).await?;
        self.staging.put(job_id, Arc::clone(&source)).await?;
        self.staging.commit(job_id).await?;

        self.report_progress(job_id, 10, "Scanning frames", "scan").await;
        let motion_threshold = self.config.motion_threshold(item_type);
        let scan = ChunkScheduler::new(self.config.scheduler.clone(), motion_threshold, self.config.scoring.flow.clone())
            .run(job_id, Arc::clone(&self.staging))
            .await;

        self.report_progress(job_id, 50, "Selecting golden frames", "select").await;
        let strategy = SelectionStrategy::resolve(&self.config.selection, &self.config.classifier, self.classifier.clone());
        let insufficient = |candidates: usize| PipelineError::InsufficientCandidates {
            frames_analyzed: scan.frames_analyzed,
            candidates,
            motion_threshold,
        };
        let selection = GoldenFrameSelector::new(&self.config.selection, visibility_regions(item_type))
            .select(&scan.candidates, &strategy, Arc::clone(&source))
            .await
            .map_err(|_| insufficient(scan.candidates.len()))?;
        let selected = read_selected(Arc::clone(&source), selection.frames.clone()).await?;
        if selected.is_empty() {
            return Err(insufficient(scan.candidates.len()));
        }

        self.report_progress(job_id, 55, "Locating item", "localize").await;
        let localization = if self.config.localization.enabled {
            ObjectLocalizer::new(self.config.localization.clone()).locate(&selected[0].image)
        } else {
            Localization::FullFrame
        };
        let cropped: Vec<SelectedFrame> = selected
            .into_iter()
            .map(|frame| {
                let image = localization.extract(&frame.image);
                SelectedFrame::new(frame.candidate, image)
            })
            .collect();

        self.report_progress(job_id, 60, "Aligning frames", "align").await;
        let aligned = self.align(cropped).await?;

        self.report_progress(job_id, 70, "Fusing defect evidence", "fuse").await;
        let (aligned, fused) = self.fuse(aligned).await?;

        self.report_progress(job_id, 80, "Analyzing regions", "regions").await;
        let region_set = RegionSet::select(item_type, &localization);
        let reference = aligned[0].image().clone();
        let (assessment, fusion_error) = match &fused {
            Ok(defects) => {
                let grading = RegionGrading::resolve(&self.config.classifier, self.classifier.clone());
                let (scores, method) = RegionAnalyzer::new(self.config.regions.clone())
                    .grade(&reference, defects, &region_set, &grading)
                    .await;
                (aggregate(scores, method), None)
            }
            Err(e) => {
                warn!(job_id, error = %e, "Defect fusion failed, report carries no assessment");
                (None, Some(e.to_string()))
            }
        };

        self.report_progress(job_id, 90, "Uploading artifacts", "upload").await;
        let mut frames = Vec::with_capacity(aligned.len());
        for frame in &aligned {
            let path = format!("frame_{:05}.png", frame.source.index());
            let url = self.publish(job_id, &path, visualization::encode_png_rgb(frame.image())).await;
            frames.push(FrameReport {
                frame_index: frame.source.index(),
                timestamp_seconds: frame.source.candidate.timestamp_seconds,
                sharpness: frame.source.candidate.sharpness,
                motion: frame.source.candidate.motion,
                url,
                alignment: frame.alignment.clone(),
            });
        }

        let artifacts = match &fused {
            Ok(defects) => self.publish_defect_artifacts(job_id, &reference, defects, &region_set).await,
            Err(_) => DefectArtifacts::default(),
        };

        self.report_progress(job_id, 95, "Assembling report", "report").await;
        let frames_fused = fused.as_ref().map(|d| d.frames_fused).unwrap_or(0);
        let report = GradingReport {
            job_id: job_id.to_string(),
            item_type,
            golden_frames: frames.iter().map(|f| f.url.clone()).collect(),
            frame_timestamps: frames.iter().map(|f| f.timestamp_seconds).collect(),
            frames,
            defect_mask: artifacts.mask,
            defect_heatmap: artifacts.heatmap,
            region_overlay: artifacts.overlay,
            max_difference_map: artifacts.max_difference,
            region_crops: artifacts.regions,
            defect_percentage: fused.as_ref().ok().map(|d| d.coverage_percent),
            assessment,
            diagnostics: diagnostics(
                &scan,
                motion_threshold,
                selection.method,
                selection.fallback_reason,
                localization,
                region_set,
                frames_fused,
                fusion_error,
                started,
            ),
        };

        self.report_progress(job_id, 100, "Complete", "done").await;
        Ok(report)
    }

    async fn align(&self, frames: Vec<SelectedFrame>) -> Result<Vec<AlignedFrame>, PipelineError> {
        let mut frames = frames.into_iter();
        let Some(reference) = frames.next() else {
            return Ok(Vec::new());
        };
        let targets: Vec<SelectedFrame> = frames.collect();

        if !self.config.alignment.enabled {
            let mut aligned = vec![AlignedFrame {
                source: reference,
                warped: None,
                alignment: Alignment::Reference,
            }];
            aligned.extend(targets.into_iter().map(|source| AlignedFrame {
                source,
                warped: None,
                alignment: Alignment::Unaligned {
                    reason: "alignment disabled".to_string(),
                },
            }));
            return Ok(aligned);
        }

        let config = self.config.alignment.clone();
        tokio::task::spawn_blocking(move || FrameAligner::new(config).align(reference, targets))
            .await
            .map_err(|e| PipelineError::StageAborted {
                stage: "align",
                reason: e.to_string(),
            })
    }

    async fn fuse(
        &self,
        aligned: Vec<AlignedFrame>,
    ) -> Result<(Vec<AlignedFrame>, Result<DefectMap, FusionError>), PipelineError> {
        let engine = DefectFusionEngine::new(self.config.fusion.clone());
        tokio::task::spawn_blocking(move || {
            let fused = {
                let images: Vec<&RgbImage> = aligned.iter().map(AlignedFrame::image).collect();
                engine.fuse(&images)
            };
            (aligned, fused)
        })
        .await
        .map_err(|e| PipelineError::StageAborted {
            stage: "fuse",
            reason: e.to_string(),
        })
    }

    /// Encodes and uploads one artifact under the job's prefix. Failures are
    /// logged and yield `None`.
    async fn publish(&self, job_id: &str, name: &str, encoded: Result<Vec<u8>, ImageError>) -> Option<String> {
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(job_id, artifact = name, error = %e, "Artifact encoding failed");
                return None;
            }
        };
        let storage = &self.config.storage;
        let path = format!("{}/{}/{}", storage.prefix, job_id, name);
        match self.store.upload(&storage.bucket, &path, bytes, PNG).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(job_id, artifact = name, error = %e, "Artifact upload failed");
                None
            }
        }
    }

    async fn publish_defect_artifacts(
        &self,
        job_id: &str,
        reference: &RgbImage,
        defects: &DefectMap,
        regions: &RegionSet,
    ) -> DefectArtifacts {
        let mask = self
            .publish(job_id, "defect_mask.png", visualization::encode_png_gray(&defects.mask))
            .await;
        let heatmap = self
            .publish(
                job_id,
                "defect_heatmap.png",
                visualization::encode_png_rgb(&visualization::render_heatmap(&defects.intensity)),
            )
            .await;
        let overlay = self
            .publish(
                job_id,
                "region_overlay.png",
                visualization::encode_png_rgb(&visualization::render_region_overlay(reference, defects, regions)),
            )
            .await;
        let max_difference = match &defects.max_difference {
            Some(map) => {
                self.publish(job_id, "max_difference.png", visualization::encode_png_gray(&map.to_gray_u8()))
                    .await
            }
            None => None,
        };

        let mut crops = Vec::new();
        for panel in visualization::region_panels(reference, defects, regions) {
            let name = panel.name;
            let url = self
                .publish(job_id, &format!("regions/{name}.png"), visualization::encode_png_rgb(&panel.image))
                .await;
            let mask_url = self
                .publish(job_id, &format!("regions/{name}_mask.png"), visualization::encode_png_gray(&panel.mask))
                .await;
            let overlay_url = self
                .publish(job_id, &format!("regions/{name}_overlay.png"), visualization::encode_png_rgb(&panel.overlay))
                .await;
            crops.push(RegionCrop {
                region: name,
                url,
                mask_url,
                overlay_url,
            });
        }
        DefectArtifacts {
            mask,
            heatmap,
            overlay,
            max_difference,
            regions: crops,
        }
    }
}

/// Re-reads the selected frames from the source, in selection order. A frame
/// that cannot be decoded is dropped.
async fn read_selected(
    source: Arc<dyn VideoSource>,
    candidates: Vec<FrameCandidate>,
) -> Result<Vec<SelectedFrame>, PipelineError> {
    let frames = tokio::task::spawn_blocking(move || -> Result<Vec<SelectedFrame>, SourceError> {
        let mut reader = source.open()?;
        Ok(candidates
            .into_iter()
            .filter_map(|candidate| match reader.read_frame(candidate.frame_index) {
                Ok(image) => Some(SelectedFrame::new(candidate, image)),
                Err(e) => {
                    warn!(frame_index = candidate.frame_index, error = %e, "Golden frame could not be re-read");
                    None
                }
            })
            .collect())
    })
    .await
    .map_err(|e| SourceError::Unreachable(format!("frame reader failed: {e}")))??;
    Ok(frames)
}

#[allow(clippy::too_many_arguments)]
fn diagnostics(
    scan: &ScanSummary,
    motion_threshold: f64,
    selection_method: SelectionMethod,
    selection_fallback: Option<String>,
    localization: Localization,
    region_set: RegionSet,
    frames_fused: usize,
    fusion_error: Option<String>,
    started: Instant,
) -> Diagnostics {
    Diagnostics {
        total_frames: scan.total_frames,
        frames_analyzed: scan.frames_analyzed,
        candidates: scan.candidates.len(),
        workers: scan.workers,
        failed_workers: scan.failed_workers,
        truncated_workers: scan.truncated_workers,
        motion_threshold,
        selection_method,
        selection_fallback,
        localization,
        region_set,
        frames_fused,
        fusion_error,
        elapsed_ms: started.elapsed().as_millis(),
    }
}
