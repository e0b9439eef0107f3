// THEORY:
// The parallel pipeline is the first, and the most expensive, stage of a
// grading job: every frame of the video has to be decoded, scored for
// sharpness and compared against its predecessor for motion. The frame range
// is split into contiguous chunks and each chunk is scanned by its own worker.
//
// Key architectural principles:
// 1.  **Independent cursors**: every worker opens its own reader on the staged
//     video. Workers share nothing but the read-only source, so they never
//     contend on a decode position.
// 2.  **Seamless boundaries**: every chunk but the first also reads the frame
//     just before its range and only primes the scorer with it. The first
//     frame of a chunk is thus compared against its true predecessor, and the
//     union of all chunks equals a single-threaded scan exactly.
// 3.  **Degrade, never fail**: a worker that cannot open the source (staging
//     may still be committing) retries a few times, then contributes nothing.
//     A worker that runs past its deadline returns what it has scored so far;
//     one that runs past its hard timeout is abandoned. None of these fail the
//     job; later stages work with whatever candidates were collected.
// 4.  **Order is not meaning**: worker results are concatenated in completion
//     order. Only set membership matters; selection sorts globally.

use crate::collaborators::source::VideoSource;
use crate::collaborators::staging::StagingArea;
use crate::config::{FlowConfig, SchedulerConfig};
use crate::core_modules::candidate_scorer::CandidateScorer;
use crate::core_modules::frame::FrameCandidate;
use crate::error::SourceError;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A contiguous range of frames `[start, end)` owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRange {
    pub worker_id: usize,
    pub start: usize,
    pub end: usize,
    /// Frame read only to prime the motion cursor, never emitted.
    pub prime_from: Option<usize>,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Splits `[0, total_frames)` into contiguous, non-overlapping chunks.
///
/// The worker count is `total_frames / min_frames_per_chunk`, at least 2 and at
/// most `max_workers`, and never more than there are frames.
pub fn plan_chunks(total_frames: usize, min_frames_per_chunk: usize, max_workers: usize) -> Vec<ChunkRange> {
    if total_frames == 0 {
        return Vec::new();
    }
    let by_size = total_frames / min_frames_per_chunk.max(1);
    let workers = by_size.max(2).min(max_workers.max(1)).min(total_frames);

    let base = total_frames / workers;
    let remainder = total_frames % workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for worker_id in 0..workers {
        let len = base + usize::from(worker_id < remainder);
        chunks.push(ChunkRange {
            worker_id,
            start,
            end: start + len,
            prime_from: start.checked_sub(1),
        });
        start += len;
    }
    chunks
}

/// What one worker produced for its chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkScan {
    pub candidates: Vec<FrameCandidate>,
    pub frames_scored: usize,
    pub frames_rejected: usize,
    /// The deadline expired before the end of the chunk.
    pub truncated: bool,
}

/// Scores one chunk with its own reader. Blocking; runs off the async runtime.
pub fn scan_range(
    source: &dyn VideoSource,
    range: ChunkRange,
    motion_threshold: f64,
    flow: &FlowConfig,
    deadline: Option<Instant>,
) -> Result<ChunkScan, SourceError> {
    let mut reader = source.open()?;
    let mut scorer = CandidateScorer::with_flow(motion_threshold, source.fps(), flow.clone());
    if let Some(prime) = range.prime_from {
        scorer.prime(&reader.read_frame(prime)?);
    }

    let mut scan = ChunkScan::default();
    for index in range.start..range.end {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            scan.truncated = true;
            break;
        }
        let frame = reader.read_frame(index)?;
        if let Some(candidate) = scorer.score(&frame, index) {
            scan.candidates.push(candidate);
        }
    }
    scan.frames_scored = scorer.frames_scored;
    scan.frames_rejected = scorer.frames_rejected;
    Ok(scan)
}

/// Result of scanning a whole video.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    /// Concatenated in worker completion order.
    pub candidates: Vec<FrameCandidate>,
    pub frames_analyzed: usize,
    pub total_frames: usize,
    pub workers: usize,
    pub failed_workers: usize,
    pub truncated_workers: usize,
}

enum WorkerOutcome {
    Scanned(ChunkScan),
    Failed(String),
}

pub struct ChunkScheduler {
    config: SchedulerConfig,
    motion_threshold: f64,
    flow: FlowConfig,
}

impl ChunkScheduler {
    pub fn new(config: SchedulerConfig, motion_threshold: f64, flow: FlowConfig) -> Self {
        Self {
            config,
            motion_threshold,
            flow,
        }
    }

    /// Opens the staged source, retrying a fixed number of times with a fixed
    /// delay while staging has not been committed or is unreachable.
    pub async fn open_with_retry(
        config: &SchedulerConfig,
        job_id: &str,
        staging: &dyn StagingArea,
    ) -> Result<Arc<dyn VideoSource>, SourceError> {
        let attempts = config.open_attempts.max(1);
        let mut attempt = 1;
        loop {
            match staging.open(job_id).await {
                Ok(source) => return Ok(source),
                Err(e) if attempt < attempts => {
                    debug!(job_id, attempt, error = %e, "Staged source not readable yet, retrying");
                    tokio::time::sleep(config.open_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scans the staged video of `job_id` across parallel chunk workers.
    pub async fn run(&self, job_id: &str, staging: Arc<dyn StagingArea>) -> ScanSummary {
        let total_frames = match Self::open_with_retry(&self.config, job_id, staging.as_ref()).await {
            Ok(source) => source.total_frames(),
            Err(e) => {
                warn!(job_id, error = %e, "Staged source unreadable, nothing scanned");
                return ScanSummary::default();
            }
        };
        let chunks = plan_chunks(total_frames, self.config.min_frames_per_chunk, self.config.max_workers);
        info!(job_id, total_frames, workers = chunks.len(), "Scanning frames");

        let mut receivers = Vec::with_capacity(chunks.len());
        for range in chunks.iter().copied() {
            let (result_sender, result_receiver) = oneshot::channel();
            let worker = Worker {
                job_id: job_id.to_string(),
                range,
                staging: Arc::clone(&staging),
                config: self.config.clone(),
                motion_threshold: self.motion_threshold,
                flow: self.flow.clone(),
            };
            tokio::spawn(async move {
                let _ = result_sender.send(worker.run().await);
            });
            receivers.push(result_receiver);
        }

        let mut summary = ScanSummary {
            total_frames,
            workers: chunks.len(),
            ..ScanSummary::default()
        };
        for outcome in join_all(receivers).await {
            match outcome {
                Ok(WorkerOutcome::Scanned(scan)) => {
                    summary.frames_analyzed += scan.frames_scored;
                    summary.truncated_workers += usize::from(scan.truncated);
                    summary.candidates.extend(scan.candidates);
                }
                Ok(WorkerOutcome::Failed(reason)) => {
                    debug!(job_id, %reason, "Worker contributed no candidates");
                    summary.failed_workers += 1;
                }
                Err(_) => summary.failed_workers += 1,
            }
        }
        info!(
            job_id,
            candidates = summary.candidates.len(),
            frames_analyzed = summary.frames_analyzed,
            failed_workers = summary.failed_workers,
            "Frame scan complete"
        );
        summary
    }
}

struct Worker {
    job_id: String,
    range: ChunkRange,
    staging: Arc<dyn StagingArea>,
    config: SchedulerConfig,
    motion_threshold: f64,
    flow: FlowConfig,
}

impl Worker {
    async fn run(self) -> WorkerOutcome {
        let worker_id = self.range.worker_id;
        let source = match ChunkScheduler::open_with_retry(&self.config, &self.job_id, self.staging.as_ref()).await {
            Ok(source) => source,
            Err(e) => {
                warn!(job_id = %self.job_id, worker_id, error = %e, "Worker could not open the staged source");
                return WorkerOutcome::Failed(e.to_string());
            }
        };

        let deadline = Instant::now() + self.config.worker_deadline();
        let range = self.range;
        let threshold = self.motion_threshold;
        let flow = self.flow;
        let scan = tokio::task::spawn_blocking(move || scan_range(source.as_ref(), range, threshold, &flow, Some(deadline)));

        match tokio::time::timeout(self.config.worker_timeout(), scan).await {
            Ok(Ok(Ok(scan))) => {
                if scan.truncated {
                    warn!(job_id = %self.job_id, worker_id, scored = scan.frames_scored, "Worker deadline hit, returning partial scan");
                }
                debug!(
                    job_id = %self.job_id,
                    worker_id,
                    start = range.start,
                    end = range.end,
                    candidates = scan.candidates.len(),
                    rejected = scan.frames_rejected,
                    "Chunk scanned"
                );
                WorkerOutcome::Scanned(scan)
            }
            Ok(Ok(Err(e))) => {
                warn!(job_id = %self.job_id, worker_id, error = %e, "Chunk scan failed");
                WorkerOutcome::Failed(e.to_string())
            }
            Ok(Err(e)) => WorkerOutcome::Failed(e.to_string()),
            Err(_) => {
                warn!(job_id = %self.job_id, worker_id, "Worker timed out and was abandoned");
                WorkerOutcome::Failed("timed out".to_string())
            }
        }
    }
}
