//! Frame sampling.
//!
//! Decodes an uploaded video from the start and keeps one frame every
//! `round(fps * interval)` decoded frames (ties to even), writing each kept
//! frame as `frame_NNNN.jpg`. Every frame is decoded, kept or not, so the
//! cost is linear in the total frame count.

use image::RgbImage;
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;

use crate::config::SamplingConfig;
use crate::constants::{FRAME_FILE_EXT, FRAME_FILE_PREFIX};
use crate::pipeline::PipelineError;

/// The video could not be opened or its frame rate is unusable.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct InvalidVideoError {
    reason: String,
}

impl InvalidVideoError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A decoded video, read front to back one frame at a time.
pub trait FrameSource {
    /// Native frame rate reported by the container, if any.
    fn fps(&self) -> Option<f64>;

    /// Next decoded frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> std::io::Result<Option<RgbImage>>;

    /// Called after the stream is exhausted; reports decoder failure.
    fn finish(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Opens videos for sampling.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, InvalidVideoError>;
}

/// Sampling parameters for one run
#[derive(Debug, Clone, Copy)]
pub struct SamplingPlan {
    pub interval_secs: f64,
    pub max_frames: Option<usize>,
}

impl From<&SamplingConfig> for SamplingPlan {
    fn from(config: &SamplingConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
            max_frames: config.max_frames,
        }
    }
}

/// A frame written to disk by the sampler
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFrame {
    pub index: usize,
    pub filename: String,
    pub source_index: u64,
    pub timestamp_secs: f64,
}

/// `frame_0000.jpg`, `frame_0001.jpg`, ...
pub fn frame_filename(index: usize) -> String {
    format!("{}{:04}.{}", FRAME_FILE_PREFIX, index, FRAME_FILE_EXT)
}

/// Number of decoded frames between two kept samples.
pub fn frame_stride(fps: Option<f64>, interval_secs: f64) -> Result<u64, InvalidVideoError> {
    let fps = match fps {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps,
        Some(fps) => {
            return Err(InvalidVideoError::new(format!(
                "cannot determine frame rate (reported {})",
                fps
            )));
        }
        None => return Err(InvalidVideoError::new("cannot determine frame rate")),
    };

    let stride = (fps * interval_secs).round_ties_even();
    if !stride.is_finite() || stride < 1.0 {
        return Ok(1);
    }
    Ok(stride as u64)
}

/// Open `video_path` and write sampled frames into `out_dir`.
pub fn extract_frames(
    decoder: &dyn VideoDecoder,
    video_path: &Path,
    plan: SamplingPlan,
    out_dir: &Path,
) -> Result<Vec<SampledFrame>, PipelineError> {
    let mut source = decoder.open(video_path)?;
    sample_frames(source.as_mut(), plan, out_dir)
}

/// Keep every frame whose zero-based read index is a multiple of the stride.
pub fn sample_frames(
    source: &mut dyn FrameSource,
    plan: SamplingPlan,
    out_dir: &Path,
) -> Result<Vec<SampledFrame>, PipelineError> {
    let fps = source.fps();
    let stride = frame_stride(fps, plan.interval_secs)?;
    let fps = fps.unwrap_or(1.0);

    let mut frames: Vec<SampledFrame> = Vec::new();
    let mut read: u64 = 0;
    let mut capped = false;

    loop {
        if plan.max_frames.is_some_and(|max| frames.len() >= max) {
            capped = true;
            break;
        }

        let Some(image) = source.next_frame()? else {
            break;
        };

        if read % stride == 0 {
            let filename = frame_filename(frames.len());
            image.save(out_dir.join(&filename))?;
            frames.push(SampledFrame {
                index: frames.len(),
                filename,
                source_index: read,
                timestamp_secs: read as f64 / fps,
            });
        }
        read += 1;
    }

    if !capped {
        if let Err(reason) = source.finish() {
            if frames.is_empty() {
                return Err(InvalidVideoError::new(reason).into());
            }
            log::warn!(
                "[frames] Decoder failed after {} frames, keeping {} samples: {}",
                read,
                frames.len(),
                reason
            );
        }
    }

    log::info!(
        "[frames] Sampled {} of {} decoded frames (stride {})",
        frames.len(),
        read,
        stride
    );
    Ok(frames)
}

// ============== ffmpeg-backed decoder ==============

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let rate = rate.trim();
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Decodes with the ffmpeg/ffprobe binaries, reading raw RGB frames from a pipe.
pub struct FfmpegDecoder {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    threads: usize,
}

impl FfmpegDecoder {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            threads: config.ffmpeg_threads,
        }
    }

    fn probe(&self, path: &Path) -> Result<(u32, u32, Option<f64>), InvalidVideoError> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error"])
            .args(["-select_streams", "v:0"])
            .args(["-show_streams"])
            .args(["-print_format", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| InvalidVideoError::new(format!("could not run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InvalidVideoError::new(format!(
                "could not open video: {}",
                stderr.trim()
            )));
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| InvalidVideoError::new(format!("unreadable probe output: {}", e)))?;
        let stream = probe
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| InvalidVideoError::new("no video stream found"))?;

        let (width, height) = match (stream.width, stream.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(InvalidVideoError::new("video stream has no dimensions")),
        };

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

        Ok((width, height, fps))
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, InvalidVideoError> {
        let (width, height, fps) = self.probe(path)?;

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-threads", &self.threads.to_string()])
            .arg("-noautorotate")
            .arg("-i")
            .arg(path)
            .args(["-an", "-sn"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InvalidVideoError::new(format!("could not run ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvalidVideoError::new("ffmpeg stdout unavailable"))?;
        // Drained on its own thread so a chatty decoder never blocks on a full pipe
        let stderr = child.stderr.take().map(collect_stderr);

        log::debug!(
            "[frames] Decoding {:?} ({}x{}, fps {:?})",
            path,
            width,
            height,
            fps
        );

        Ok(Box::new(FfmpegFrames {
            path: path.to_path_buf(),
            child,
            stdout: Some(stdout),
            stderr,
            width,
            height,
            fps,
        }))
    }
}

/// Lines of ffmpeg stderr kept in a decode failure reason
const STDERR_TAIL_LINES: usize = 3;

fn collect_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Last `lines` non-empty lines of `text`, joined with `"; "`.
fn stderr_tail(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    kept[kept.len().saturating_sub(lines)..].join("; ")
}

struct FfmpegFrames {
    path: PathBuf,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    fps: Option<f64>,
}

impl FrameSource for FfmpegFrames {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn next_frame(&mut self) -> std::io::Result<Option<RgbImage>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let frame_len = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; frame_len];
        let mut filled = 0;
        while filled < frame_len {
            match stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled < frame_len {
            if filled > 0 {
                log::warn!(
                    "[frames] Dropping truncated trailing frame from {:?} ({} of {} bytes)",
                    self.path,
                    filled,
                    frame_len
                );
            }
            self.stdout = None;
            return Ok(None);
        }

        Ok(RgbImage::from_raw(self.width, self.height, buf))
    }

    fn finish(&mut self) -> Result<(), String> {
        self.stdout = None;
        let status = self
            .child
            .wait()
            .map_err(|e| format!("could not wait for ffmpeg: {}", e))?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }

        let detail = stderr_tail(&stderr, STDERR_TAIL_LINES);
        if detail.is_empty() {
            Err(format!("ffmpeg decode failed ({})", status))
        } else {
            Err(format!("ffmpeg decode failed ({}): {}", status, detail))
        }
    }
}

impl Drop for FfmpegFrames {
    fn drop(&mut self) {
        self.stdout = None;
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
