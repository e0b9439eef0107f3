use crate::error::SourceError;
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// A decode cursor over one video. Owned by exactly one worker.
pub trait FrameReader: Send {
    fn read_frame(&mut self, index: usize) -> Result<RgbImage, SourceError>;
}

/// A seekable, frame-addressable video. Every `open` yields an independent
/// cursor, so concurrent workers never share one.
pub trait VideoSource: Send + Sync {
    fn total_frames(&self) -> usize;
    fn fps(&self) -> f64;
    fn open(&self) -> Result<Box<dyn FrameReader>, SourceError>;
}

/// Resolves a source locator into a local video.
#[async_trait]
pub trait VideoIngress: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Arc<dyn VideoSource>, SourceError>;
}

/// Decoded frames held in memory.
#[derive(Clone)]
pub struct InMemorySource {
    frames: Arc<Vec<RgbImage>>,
    fps: f64,
}

impl InMemorySource {
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Self {
        Self {
            frames: Arc::new(frames),
            fps,
        }
    }
}

struct InMemoryReader {
    frames: Arc<Vec<RgbImage>>,
}

impl FrameReader for InMemoryReader {
    fn read_frame(&mut self, index: usize) -> Result<RgbImage, SourceError> {
        self.frames.get(index).cloned().ok_or(SourceError::FrameOutOfRange {
            index,
            total: self.frames.len(),
        })
    }
}

impl VideoSource for InMemorySource {
    fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, SourceError> {
        Ok(Box::new(InMemoryReader {
            frames: Arc::clone(&self.frames),
        }))
    }
}

/// A video extracted to a directory of image files, one per frame, in natural
/// name order (`frame_2.png` before `frame_10.png`).
#[derive(Debug, Clone)]
pub struct FrameDirectorySource {
    files: Arc<Vec<PathBuf>>,
    fps: f64,
}

impl FrameDirectorySource {
    pub fn open_dir(dir: &Path, fps: f64) -> Result<Self, SourceError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            return Err(SourceError::Empty(dir.display().to_string()));
        }
        files.sort_by_cached_key(|path| frame_order_key(path));
        Ok(Self {
            files: Arc::new(files),
            fps,
        })
    }
}

/// Stem prefix, then the stem's trailing number, then the full name. Frame
/// numbers need not be zero-padded.
fn frame_order_key(path: &Path) -> (String, Option<u64>, String) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let prefix = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = stem[prefix.len()..].parse::<u64>().ok();
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
    (prefix.to_string(), number, name.to_string())
}

struct DirectoryReader {
    files: Arc<Vec<PathBuf>>,
}

impl FrameReader for DirectoryReader {
    fn read_frame(&mut self, index: usize) -> Result<RgbImage, SourceError> {
        let path = self.files.get(index).ok_or(SourceError::FrameOutOfRange {
            index,
            total: self.files.len(),
        })?;
        Ok(image::open(path)?.to_rgb8())
    }
}

impl VideoSource for FrameDirectorySource {
    fn total_frames(&self) -> usize {
        self.files.len()
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, SourceError> {
        Ok(Box::new(DirectoryReader {
            files: Arc::clone(&self.files),
        }))
    }
}

/// Treats locators as local frame directories (`/path` or `file:///path`).
#[derive(Debug, Clone)]
pub struct FrameDirectoryIngress {
    fps: f64,
}

impl FrameDirectoryIngress {
    pub fn new(fps: f64) -> Self {
        Self { fps }
    }
}

#[async_trait]
impl VideoIngress for FrameDirectoryIngress {
    async fn fetch(&self, locator: &str) -> Result<Arc<dyn VideoSource>, SourceError> {
        let path = PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator));
        if !path.is_dir() {
            return Err(SourceError::Unreachable(locator.to_string()));
        }
        let fps = self.fps;
        let source = tokio::task::spawn_blocking(move || FrameDirectorySource::open_dir(&path, fps))
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))??;
        Ok(Arc::new(source))
    }
}
