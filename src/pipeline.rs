//! One run, start to finish: sample frames, detect, summarize.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::aggregate::{AggregateTarget, RunSummary, aggregate};
use crate::detect::Detector;
use crate::frames::{InvalidVideoError, SamplingPlan, VideoDecoder, extract_frames};
use crate::services::runs::RunWorkspace;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid video: {0}")]
    InvalidVideo(#[from] InvalidVideoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Decoder and detector are loaded once at startup and shared by every run.
pub struct Pipeline {
    decoder: Arc<dyn VideoDecoder>,
    detector: Arc<dyn Detector>,
    plan: SamplingPlan,
    public_base_url: String,
}

impl Pipeline {
    pub fn new(
        decoder: Arc<dyn VideoDecoder>,
        detector: Arc<dyn Detector>,
        plan: SamplingPlan,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            decoder,
            detector,
            plan,
            public_base_url: public_base_url.into(),
        }
    }

    /// Blocking; call from a blocking-capable thread.
    pub fn run(&self, workspace: &RunWorkspace, video_path: &Path) -> Result<RunSummary, PipelineError> {
        let frames = extract_frames(
            self.decoder.as_ref(),
            video_path,
            self.plan,
            &workspace.frames_dir(),
        )?;
        log::info!(
            "[detect] Run {} sampled {} frames every {}s",
            workspace.id(),
            frames.len(),
            self.plan.interval_secs
        );
        for frame in &frames {
            log::debug!(
                "[detect] Run {} sample {} ({}) <- source frame {} at {:.2}s",
                workspace.id(),
                frame.index,
                frame.filename,
                frame.source_index,
                frame.timestamp_secs
            );
        }

        let frames_dir = workspace.frames_dir();
        let results_dir = workspace.results_dir();
        let summary = aggregate(
            self.detector.as_ref(),
            &AggregateTarget {
                run_id: workspace.id(),
                frames_dir: &frames_dir,
                results_dir: &results_dir,
                public_base_url: &self.public_base_url,
            },
        )?;

        log::info!(
            "[detect] Run {} done: {} frames, {} detections, {} failed, accuracy {}",
            workspace.id(),
            summary.total_frames,
            summary.total_detections,
            summary.failed_frames,
            summary.accuracy
        );
        Ok(summary)
    }
}
