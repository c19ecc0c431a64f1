//! Fakes shared by unit tests: an in-memory video source, a scripted
//! detector and a fully wired app that needs neither ffmpeg nor a model.

use anyhow::{Result, bail};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::AppState;
use crate::detect::{Detection, Detector, StubDetector};
use crate::frames::{FrameSource, InvalidVideoError, SamplingPlan, VideoDecoder};
use crate::pipeline::Pipeline;
use crate::routes::build_router;
use crate::services::runs::RunRegistry;

const FRAME_WIDTH: u32 = 32;
const FRAME_HEIGHT: u32 = 24;
const MULTIPART_BOUNDARY: &str = "framescan-test-boundary";

fn gradient_frame(seed: usize) -> RgbImage {
    RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
        Rgb([(x * 8) as u8, (y * 10) as u8, (seed % 256) as u8])
    })
}

/// Save a small JPEG frame to `path`
pub fn write_test_frame(path: &Path) {
    gradient_frame(0).save(path).unwrap();
}

/// Yields `total` frames at a fixed frame rate, optionally failing at the end
pub struct SyntheticSource {
    fps: f64,
    total: usize,
    emitted: usize,
    failure: Option<String>,
}

impl SyntheticSource {
    pub fn new(fps: f64, total: usize) -> Self {
        Self {
            fps,
            total,
            emitted: 0,
            failure: None,
        }
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }
}

impl FrameSource for SyntheticSource {
    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn next_frame(&mut self) -> std::io::Result<Option<RgbImage>> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        self.emitted += 1;
        Ok(Some(gradient_frame(self.emitted)))
    }

    fn finish(&mut self) -> Result<(), String> {
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// Treats the uploaded file as a description like `fps=30 frames=95`.
/// Anything else is an unreadable video.
pub struct SyntheticDecoder;

impl VideoDecoder for SyntheticDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, InvalidVideoError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| InvalidVideoError::new(format!("could not open video: {}", e)))?;

        let mut fps = None;
        let mut frames = None;
        for token in text.split_whitespace() {
            match token.split_once('=') {
                Some(("fps", value)) => fps = value.parse::<f64>().ok(),
                Some(("frames", value)) => frames = value.parse::<usize>().ok(),
                _ => {}
            }
        }

        match (fps, frames) {
            (Some(fps), Some(frames)) => Ok(Box::new(SyntheticSource::new(fps, frames))),
            _ => Err(InvalidVideoError::new("could not open video: no video stream")),
        }
    }
}

/// Returns `per_frame` boxes per call and errors on the listed call indices
pub struct ScriptedDetector {
    inner: StubDetector,
    fail_on: Vec<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(per_frame: usize) -> Self {
        Self {
            inner: StubDetector::new(per_frame),
            fail_on: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on = calls.to_vec();
        self
    }

    /// Block each call for `delay`, like a slow model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_on.contains(&call) {
            bail!("scripted failure on call {}", call);
        }
        self.inner.detect(image)
    }
}

/// App state over a temporary data directory
pub struct TestApp {
    _root: TempDir,
    runs_dir: PathBuf,
    state: Arc<AppState>,
}

impl TestApp {
    pub async fn new(max_retained: usize) -> Self {
        Self::with_detector(max_retained, Arc::new(StubDetector::new(2))).await
    }

    pub async fn with_detector(max_retained: usize, detector: Arc<dyn Detector>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let runs_dir = root.path().join("runs");
        let runs = RunRegistry::init(runs_dir.clone(), max_retained, Duration::from_secs(3600))
            .await
            .unwrap();

        let pipeline = Pipeline::new(
            Arc::new(SyntheticDecoder),
            detector,
            SamplingPlan {
                interval_secs: 1.0,
                max_frames: None,
            },
            "http://localhost:5000",
        );

        Self {
            _root: root,
            runs_dir,
            state: Arc::new(AppState {
                pipeline: Arc::new(pipeline),
                runs: Arc::new(runs),
                run_slots: Semaphore::new(1),
            }),
        }
    }

    pub fn router(&self) -> Router {
        self.router_with_limit(crate::constants::MAX_VIDEO_UPLOAD_SIZE)
    }

    pub fn router_with_limit(&self, max_upload_bytes: usize) -> Router {
        build_router(self.state.clone(), max_upload_bytes)
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        self.state.runs.clone()
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.runs_dir.clone()
    }

    /// Number of run directories on disk
    pub fn run_dirs(&self) -> usize {
        std::fs::read_dir(&self.runs_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count()
    }
}

/// `POST /detect` with a multipart body of `(name, filename, data)` fields
pub fn multipart_request(fields: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
    let mut body: Vec<u8> = Vec::new();
    for (name, filename, data) in fields {
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        let disposition = match filename {
            Some(filename) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                name, filename
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/detect")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}
