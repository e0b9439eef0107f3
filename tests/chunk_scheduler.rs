mod common;

use common::*;
use condition_vision::collaborators::{FrameReader, InMemorySource, MemoryStaging, StagingArea, VideoSource};
use condition_vision::config::{FlowConfig, SchedulerConfig};
use condition_vision::core_modules::candidate_scorer::CandidateScorer;
use condition_vision::core_modules::frame::FrameCandidate;
use condition_vision::core_modules::frame_selector::select_golden_frames;
use condition_vision::error::SourceError;
use condition_vision::parallel_pipeline::{ChunkScheduler, plan_chunks};
use image::RgbImage;
use image::imageops::{self, FilterType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn fast_retry(max_workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        min_frames_per_chunk: 30,
        max_workers,
        open_attempts: 3,
        open_retry_delay_ms: 5,
        ..SchedulerConfig::default()
    }
}

fn sequential(frames: &[RgbImage], threshold: f64) -> BTreeSet<usize> {
    let mut scorer = CandidateScorer::new(threshold, FPS);
    frames
        .iter()
        .enumerate()
        .filter_map(|(i, f)| scorer.score(f, i))
        .map(|c| c.frame_index)
        .collect()
}

fn indices(candidates: &[FrameCandidate]) -> BTreeSet<usize> {
    candidates.iter().map(|c| c.frame_index).collect()
}

/// The item video with the camera knocked diagonally for a few frames.
fn knocked_video(total: usize) -> Vec<RgbImage> {
    const KNOCK: u32 = 10;
    item_video(total)
        .into_iter()
        .enumerate()
        .map(|(i, frame)| {
            if i % 25 != 12 {
                return frame;
            }
            let background = *frame.get_pixel(0, 0);
            RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
                if x >= KNOCK && y >= KNOCK { *frame.get_pixel(x - KNOCK, y - KNOCK) } else { background }
            })
        })
        .collect()
}

async fn staged(staging: &dyn StagingArea, frames: Vec<RgbImage>) {
    staging.put("job", Arc::new(InMemorySource::new(frames, FPS))).await.unwrap();
    staging.commit("job").await.unwrap();
}

#[tokio::test]
async fn test_chunked_scan_equals_single_threaded_scan() {
    let frames = knocked_video(150);
    let expected = sequential(&frames, 1.0);
    assert!(expected.contains(&0));

    let staging = Arc::new(FlakyStaging::new(0, usize::MAX));
    staged(&staging.inner, frames).await;
    let summary = ChunkScheduler::new(fast_retry(8), 1.0, FlowConfig::default())
        .run("job", staging)
        .await;

    assert_eq!(summary.workers, plan_chunks(150, 30, 8).len());
    assert_eq!(summary.failed_workers, 0);
    assert_eq!(summary.frames_analyzed, 150);
    assert_eq!(indices(&summary.candidates), expected);
}

#[tokio::test]
async fn test_workers_retry_while_staging_commits() {
    let frames = item_video(90);
    let expected = sequential(&frames, 1.0);

    let staging = Arc::new(FlakyStaging::new(2, usize::MAX));
    staged(&staging.inner, frames).await;
    let summary = ChunkScheduler::new(fast_retry(3), 1.0, FlowConfig::default())
        .run("job", staging)
        .await;

    assert_eq!(summary.failed_workers, 0);
    assert_eq!(indices(&summary.candidates), expected);
}

#[tokio::test]
async fn test_workers_that_never_open_degrade_coverage_only() {
    let staging = Arc::new(FlakyStaging::new(0, 1));
    staged(&staging.inner, item_video(90)).await;
    let summary = ChunkScheduler::new(fast_retry(3), 1.0, FlowConfig::default())
        .run("job", staging)
        .await;

    assert_eq!(summary.total_frames, 90);
    assert_eq!(summary.workers, 3);
    assert_eq!(summary.failed_workers, 3);
    assert!(summary.candidates.is_empty());
}

/// A source whose decoder hangs on one frame until released, as on a corrupt
/// stretch of video.
struct HangingSource {
    inner: InMemorySource,
    total: usize,
    hang_at: usize,
    released: Arc<AtomicBool>,
}

struct HangingReader {
    inner: Box<dyn FrameReader>,
    hang_at: usize,
    released: Arc<AtomicBool>,
}

impl FrameReader for HangingReader {
    fn read_frame(&mut self, index: usize) -> Result<RgbImage, SourceError> {
        if index == self.hang_at {
            let give_up = Instant::now() + Duration::from_secs(30);
            while !self.released.load(Ordering::SeqCst) && Instant::now() < give_up {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        self.inner.read_frame(index)
    }
}

impl VideoSource for HangingSource {
    fn total_frames(&self) -> usize {
        self.total
    }

    fn fps(&self) -> f64 {
        FPS
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, SourceError> {
        Ok(Box::new(HangingReader {
            inner: self.inner.open()?,
            hang_at: self.hang_at,
            released: Arc::clone(&self.released),
        }))
    }
}

#[tokio::test]
async fn test_hung_worker_is_abandoned_while_the_others_deliver() {
    let frames: Vec<RgbImage> = item_video(90)
        .iter()
        .map(|f| imageops::resize(f, 64, 48, FilterType::Nearest))
        .collect();
    let healthy: BTreeSet<usize> = sequential(&frames, 1.0).into_iter().filter(|&i| i < 60).collect();
    assert!(!healthy.is_empty());

    let released = Arc::new(AtomicBool::new(false));
    let source = HangingSource {
        inner: InMemorySource::new(frames, FPS),
        total: 90,
        hang_at: 75,
        released: Arc::clone(&released),
    };
    let staging = Arc::new(MemoryStaging::new());
    staging.put("job", Arc::new(source)).await.unwrap();
    staging.commit("job").await.unwrap();

    let config = SchedulerConfig {
        worker_timeout_secs: 5,
        ..fast_retry(3)
    };
    let summary = ChunkScheduler::new(config, 1.0, FlowConfig::default()).run("job", staging).await;
    released.store(true, Ordering::SeqCst);

    // Chunks [0, 30) and [30, 60) deliver; the worker on [60, 90) is dropped.
    assert_eq!(summary.workers, 3);
    assert_eq!(summary.failed_workers, 1);
    assert_eq!(indices(&summary.candidates), healthy);

    let golden = select_golden_frames(&summary.candidates, 5, 15);
    assert!(!golden.is_empty());
    assert!(golden.iter().all(|c| c.frame_index < 60));
}
