use image::RgbImage;
use serde::Serialize;

/// A frame that passed the motion-stability filter, with its quality scalars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCandidate {
    pub frame_index: usize,
    /// Variance of the Laplacian response. Higher is sharper.
    pub sharpness: f64,
    /// Mean dense optical-flow magnitude against the previous frame, in pixels.
    pub motion: f64,
    pub timestamp_seconds: f64,
}

/// A golden frame re-read from the source, ready for the pixel stages.
#[derive(Debug, Clone)]
pub struct SelectedFrame {
    pub candidate: FrameCandidate,
    pub image: RgbImage,
}

impl SelectedFrame {
    pub fn new(candidate: FrameCandidate, image: RgbImage) -> Self {
        Self { candidate, image }
    }

    pub fn index(&self) -> usize {
        self.candidate.frame_index
    }
}
