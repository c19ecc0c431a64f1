//! Detection aggregation.
//!
//! Runs the detector over every sampled frame of a run, writes an annotated
//! copy of each frame, and folds the per-frame results into a [`RunSummary`].

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::detect::{Detector, draw_detections};
use crate::pipeline::PipelineError;

const FRAME_IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Ok,
    Failed,
}

/// Outcome for one sampled frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameResult {
    pub frame: String,
    pub detections: Vec<[f32; 6]>,
    pub url: Option<String>,
    pub status: FrameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub results: Vec<FrameResult>,
    pub accuracy: f64,
    pub false_positives: u32,
    pub accuracy_gain: u32,
    pub total_frames: usize,
    pub total_detections: usize,
    pub failed_frames: usize,
}

/// Detections per processed frame as a percentage, rounded to one decimal
/// with ties to even. Not a quality measure; zero when nothing was processed.
pub fn detection_accuracy(total_detections: usize, total_frames: usize) -> f64 {
    if total_frames == 0 {
        return 0.0;
    }
    let ratio = total_detections as f64 / total_frames as f64 * 100.0;
    (ratio * 10.0).round_ties_even() / 10.0
}

/// Where a run's frames come from and where annotated copies go
pub struct AggregateTarget<'a> {
    pub run_id: &'a str,
    pub frames_dir: &'a Path,
    pub results_dir: &'a Path,
    /// Public URL prefix, e.g. `http://localhost:5000`
    pub public_base_url: &'a str,
}

impl AggregateTarget<'_> {
    fn result_url(&self, frame: &str) -> String {
        format!("{}/results/{}/{}", self.public_base_url, self.run_id, frame)
    }
}

/// Frame images in `dir`, sorted by file name (which is temporal order).
pub fn list_frame_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FRAME_IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Detect, annotate and summarize every frame of a run.
///
/// A frame that cannot be decoded or whose detection fails is reported as
/// failed and the batch continues. Failing to write an annotated copy
/// aborts the run.
pub fn aggregate(
    detector: &dyn Detector,
    target: &AggregateTarget<'_>,
) -> Result<RunSummary, PipelineError> {
    let mut results = Vec::new();
    let mut total_detections = 0usize;
    let mut total_frames = 0usize;
    let mut failed_frames = 0usize;

    for path in list_frame_files(target.frames_dir)? {
        let frame = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let outcome = image::open(&path)
            .map(|img| img.to_rgb8())
            .map_err(|e| format!("could not decode frame: {}", e))
            .and_then(|img| {
                detector
                    .detect(&img)
                    .map(|detections| (img, detections))
                    .map_err(|e| format!("detection failed: {:#}", e))
            });

        match outcome {
            Ok((mut annotated, detections)) => {
                draw_detections(&mut annotated, &detections);
                annotated.save(target.results_dir.join(&frame))?;

                total_detections += detections.len();
                total_frames += 1;
                results.push(FrameResult {
                    url: Some(target.result_url(&frame)),
                    frame,
                    detections: detections.iter().map(|d| d.to_row()).collect(),
                    status: FrameStatus::Ok,
                    error: None,
                });
            }
            Err(reason) => {
                log::warn!("[detect] Run {} frame {} failed: {}", target.run_id, frame, reason);
                failed_frames += 1;
                results.push(FrameResult {
                    frame,
                    detections: Vec::new(),
                    url: None,
                    status: FrameStatus::Failed,
                    error: Some(reason),
                });
            }
        }
    }

    Ok(RunSummary {
        run_id: target.run_id.to_string(),
        results,
        accuracy: detection_accuracy(total_detections, total_frames),
        false_positives: 0,
        accuracy_gain: 0,
        total_frames,
        total_detections,
        failed_frames,
    })
}
