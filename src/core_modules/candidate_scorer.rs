// THEORY:
// The `CandidateScorer` is the leaf of the frame-selection layer. It is a
// small stateful entity that walks a contiguous run of frames, remembering the
// grayscale version of the last frame it saw, and for every new frame produces
// two scalars:
//
// 1.  **Sharpness**: the variance of the Laplacian response. Focus blur and
//     motion blur both flatten high-frequency detail, so a higher variance means
//     a crisper frame.
// 2.  **Motion**: the mean dense optical-flow magnitude against the remembered
//     frame. The first frame a scorer sees has nothing to compare against and
//     is stable by definition (motion exactly 0).
//
// Motion is a hard filter, not a penalty: a frame above the ceiling is dropped
// and never becomes a candidate. The cursor advances either way, so the next
// frame is always compared against its true predecessor.
//
// `prime` advances the cursor without emitting anything. Chunk workers use it
// to read the frame just before their range so the first frame of a chunk is
// measured exactly as a single-threaded pass would measure it.

use crate::config::FlowConfig;
use crate::core_modules::frame::FrameCandidate;
use crate::core_modules::imaging::{laplacian_variance, to_gray};
use crate::core_modules::optical_flow::mean_flow_magnitude;
use image::{GrayImage, RgbImage};

pub struct CandidateScorer {
    motion_threshold: f64,
    fps: f64,
    flow: FlowConfig,
    previous: Option<GrayImage>,
    /// Frames scored (primed frames excluded).
    pub frames_scored: usize,
    /// Frames rejected by the motion filter.
    pub frames_rejected: usize,
}

impl CandidateScorer {
    pub fn new(motion_threshold: f64, fps: f64) -> Self {
        Self::with_flow(motion_threshold, fps, FlowConfig::default())
    }

    pub fn with_flow(motion_threshold: f64, fps: f64, flow: FlowConfig) -> Self {
        Self {
            motion_threshold,
            fps,
            flow,
            previous: None,
            frames_scored: 0,
            frames_rejected: 0,
        }
    }

    /// Remembers `frame` as the predecessor of the next scored frame.
    pub fn prime(&mut self, frame: &RgbImage) {
        self.previous = Some(to_gray(frame));
    }

    /// Scores `frame` and advances the cursor. Returns `None` when the frame
    /// moved more than the stability ceiling.
    pub fn score(&mut self, frame: &RgbImage, frame_index: usize) -> Option<FrameCandidate> {
        let gray = to_gray(frame);
        let motion = match &self.previous {
            Some(previous) => mean_flow_magnitude(previous, &gray, &self.flow),
            None => 0.0,
        };
        let sharpness = laplacian_variance(&gray);
        self.previous = Some(gray);
        self.frames_scored += 1;

        if motion > self.motion_threshold {
            self.frames_rejected += 1;
            return None;
        }

        let timestamp_seconds = if self.fps > 0.0 { frame_index as f64 / self.fps } else { 0.0 };
        Some(FrameCandidate {
            frame_index,
            sharpness: sharpness.max(0.0),
            motion,
            timestamp_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checker(w: u32, h: u32, offset: u32, cell: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let on = ((x + offset) / cell + y / cell) % 2 == 0;
            if on { Rgb([230, 230, 230]) } else { Rgb([20, 20, 20]) }
        })
    }

    #[test]
    fn test_first_frame_is_stable_by_definition() {
        let mut scorer = CandidateScorer::new(1.0, 30.0);
        let candidate = scorer.score(&checker(64, 48, 0, 8), 0).unwrap();
        assert_eq!(candidate.motion, 0.0);
        assert!(candidate.sharpness > 0.0);
        assert_eq!(candidate.timestamp_seconds, 0.0);
    }

    #[test]
    fn test_static_frames_pass_and_carry_timestamps() {
        let frame = checker(64, 48, 0, 8);
        let mut scorer = CandidateScorer::new(1.0, 30.0);
        scorer.score(&frame, 0);
        let candidate = scorer.score(&frame, 45).unwrap();
        assert_eq!(candidate.motion, 0.0);
        assert!((candidate.timestamp_seconds - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_moving_frame_is_rejected_but_cursor_advances() {
        let smooth = |shift: f32| {
            RgbImage::from_fn(96, 72, |x, y| {
                let v = 128.0
                    + 60.0 * (2.0 * std::f32::consts::PI * (x as f32 - shift) / 32.0).sin()
                    + 50.0 * (2.0 * std::f32::consts::PI * y as f32 / 28.0).sin();
                let v = v.round().clamp(0.0, 255.0) as u8;
                Rgb([v, v, v])
            })
        };
        let mut scorer = CandidateScorer::new(1.0, 30.0);
        assert!(scorer.score(&smooth(0.0), 0).is_some());
        assert!(scorer.score(&smooth(5.0), 1).is_none());
        // Same as the frame just rejected: stable again.
        assert!(scorer.score(&smooth(5.0), 2).is_some());
        assert_eq!(scorer.frames_scored, 3);
        assert_eq!(scorer.frames_rejected, 1);
    }

    #[test]
    fn test_prime_sets_predecessor_without_counting() {
        let frame = checker(64, 48, 0, 8);
        let mut scorer = CandidateScorer::new(1.0, 30.0);
        scorer.prime(&frame);
        let candidate = scorer.score(&frame, 10).unwrap();
        assert_eq!(candidate.motion, 0.0);
        assert_eq!(scorer.frames_scored, 1);
    }
}
