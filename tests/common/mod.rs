#![allow(dead_code)]

use async_trait::async_trait;
use condition_vision::collaborators::{
    Classification, InMemorySource, MemoryStaging, ProgressSink, StagingArea, VideoIngress, VideoSource, VisualClassifier,
};
use condition_vision::error::{ClassifierError, ProgressError, SourceError};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FPS: f64 = 30.0;

const BACKGROUND: Rgb<u8> = Rgb([25, 25, 30]);
const PAPER: Rgb<u8> = Rgb([205, 200, 190]);

/// Item bounds in the frame, `[x0, x1) x [y0, y1)`.
pub const ITEM: (u32, u32, u32, u32) = (30, 130, 10, 110);
/// The damaged strip along the item's left edge ends here.
const SPINE_DAMAGE_END: u32 = 40;

/// A flat item on a dark table, filmed from a fixed position. The left edge of
/// the item carries dark scratches whose darkness varies with the lighting of
/// each frame, so sharpness changes from frame to frame while nothing moves.
pub fn item_frame(index: usize) -> RgbImage {
    let (x0, x1, y0, y1) = ITEM;
    let scratch = 40 + (index % 9) as u8 * 3;
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let on_item = x >= x0 && x < x1 && y >= y0 && y < y1;
        if !on_item {
            return BACKGROUND;
        }
        let scratched = x < SPINE_DAMAGE_END && ((y - y0) % 6 < 2 || (x + y) % 11 == 0);
        if scratched { Rgb([scratch, scratch - 5, scratch - 10]) } else { PAPER }
    })
}

pub fn item_video(total: usize) -> Vec<RgbImage> {
    (0..total).map(item_frame).collect()
}

pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("condition-vision-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes the frames as `frame_00000.png`, `frame_00001.png`, ...
pub fn write_frames(dir: &Path, frames: &[RgbImage]) {
    for (i, frame) in frames.iter().enumerate() {
        frame.save(dir.join(format!("frame_{i:05}.png"))).unwrap();
    }
}

/// Hands out a prepared source for any locator.
pub struct StaticIngress(pub Arc<dyn VideoSource>);

impl StaticIngress {
    pub fn frames(frames: Vec<RgbImage>) -> Self {
        Self(Arc::new(InMemorySource::new(frames, FPS)))
    }
}

#[async_trait]
impl VideoIngress for StaticIngress {
    async fn fetch(&self, _locator: &str) -> Result<Arc<dyn VideoSource>, SourceError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Never finishes downloading within any reasonable budget.
pub struct StalledIngress;

#[async_trait]
impl VideoIngress for StalledIngress {
    async fn fetch(&self, locator: &str) -> Result<Arc<dyn VideoSource>, SourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(SourceError::Unreachable(locator.to_string()))
    }
}

/// Staging whose `open` fails the first `failures` times, as if the staged
/// copy were still being committed, and then only succeeds `successes` times.
pub struct FlakyStaging {
    pub inner: MemoryStaging,
    failures_left: AtomicUsize,
    successes_left: AtomicUsize,
}

impl FlakyStaging {
    pub fn new(failures: usize, successes: usize) -> Self {
        Self {
            inner: MemoryStaging::new(),
            failures_left: AtomicUsize::new(failures),
            successes_left: AtomicUsize::new(successes),
        }
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StagingArea for FlakyStaging {
    async fn put(&self, job_id: &str, source: Arc<dyn VideoSource>) -> Result<(), SourceError> {
        self.inner.put(job_id, source).await
    }

    async fn commit(&self, job_id: &str) -> Result<(), SourceError> {
        self.inner.commit(job_id).await
    }

    async fn open(&self, job_id: &str) -> Result<Arc<dyn VideoSource>, SourceError> {
        if Self::take(&self.failures_left) || !Self::take(&self.successes_left) {
            return Err(SourceError::NotCommitted(job_id.to_string()));
        }
        self.inner.open(job_id).await
    }

    async fn remove(&self, job_id: &str) -> Result<(), SourceError> {
        self.inner.remove(job_id).await
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    pub updates: Mutex<Vec<(u8, String)>>,
}

impl RecordingProgress {
    pub fn percents(&self) -> Vec<u8> {
        self.updates.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn report(&self, _job_id: &str, percent: u8, _message: &str, step: &str) -> Result<(), ProgressError> {
        self.updates.lock().unwrap().push((percent, step.to_string()));
        Ok(())
    }
}

/// A progress tracker that is always down.
pub struct BrokenProgress;

#[async_trait]
impl ProgressSink for BrokenProgress {
    async fn report(&self, _job_id: &str, _percent: u8, _message: &str, _step: &str) -> Result<(), ProgressError> {
        Err(ProgressError("tracker offline".to_string()))
    }
}

pub struct FixedClassifier {
    pub label: &'static str,
    pub confidence: f64,
    pub calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(label: &'static str, confidence: f64) -> Self {
        Self {
            label,
            confidence,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VisualClassifier for FixedClassifier {
    async fn classify(&self, _image: &RgbImage, _function_id: &str) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Classification::new(self.label, self.confidence))
    }
}

pub struct OfflineClassifier;

#[async_trait]
impl VisualClassifier for OfflineClassifier {
    async fn classify(&self, _image: &RgbImage, _function_id: &str) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::Unavailable("service offline".to_string()))
    }
}
