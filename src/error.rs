// THEORY:
// Errors are split by how far they are allowed to travel. Only `PipelineError`
// ever reaches the caller of `GradingPipeline::run`; every other error type is
// caught at its stage boundary and turned into a degraded (but still produced)
// result. Keeping them as separate enums makes that boundary visible in the
// type signatures instead of relying on convention.

use std::time::Duration;
use thiserror::Error;

/// Job-terminal failures. Everything else degrades the report instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to acquire source video: {0}")]
    Acquisition(#[from] SourceError),
    #[error(
        "Insufficient candidates: {candidates} stable frames out of {frames_analyzed} analyzed (motion threshold {motion_threshold})"
    )]
    InsufficientCandidates {
        frames_analyzed: usize,
        candidates: usize,
        motion_threshold: f64,
    },
    #[error("Job {job_id} exceeded its {budget:?} budget")]
    Timeout { job_id: String, budget: Duration },
    #[error("Blocking stage {stage} did not complete: {reason}")]
    StageAborted { stage: &'static str, reason: String },
}

/// Failures reading the source video or the shared staging area.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source unreachable: {0}")]
    Unreachable(String),
    #[error("Staged source for job {0} is not committed yet")]
    NotCommitted(String),
    #[error("Frame {index} is out of range (total {total})")]
    FrameOutOfRange { index: usize, total: usize },
    #[error("Source contains no frames: {0}")]
    Empty(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode artifact: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Upload rejected for {path}: {reason}")]
    Rejected { path: String, reason: String },
}

#[derive(Error, Debug)]
#[error("Progress update failed: {0}")]
pub struct ProgressError(pub String);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Stage-local failures of homography estimation. Alignment degrades to the
/// unwarped frame when one occurs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("Too few correspondences: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("Degenerate configuration: {0}")]
    Degenerate(String),
    #[error("Too few inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// Stage-local failures of defect fusion. The job continues without a grade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("No frames to fuse")]
    NoFrames,
    #[error("Reference frame is empty ({width}x{height})")]
    EmptyReference { width: u32, height: u32 },
}

/// Golden-frame selection failures. The pipeline turns these into
/// `PipelineError::InsufficientCandidates` with the scan context attached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("No candidates to select from")]
    NoCandidates,
}
