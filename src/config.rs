//! Runtime configuration.
//!
//! Every setting comes from an environment variable with a default. Values
//! that fail to parse or validate fall back to the default instead of
//! aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::MAX_VIDEO_UPLOAD_SIZE;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5000";
const DEFAULT_MODEL_PATH: &str = "yolov5nu.onnx";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 300;
const DEFAULT_FRAME_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 1;
const DEFAULT_MAX_RETAINED_RUNS: usize = 1;
const DEFAULT_RUN_RETENTION_SECS: u64 = 3600;
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 60;
const DEFAULT_FFMPEG_THREADS: usize = 1;

/// Which detector implementation to load at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorBackend {
    /// ONNX YOLO model executed with tract
    Yolo,
    /// Model-free detector returning fixed boxes
    Stub,
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo" => Ok(DetectorBackend::Yolo),
            "stub" => Ok(DetectorBackend::Stub),
            other => Err(format!("unknown detector backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: DetectorBackend,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub interval_secs: f64,
    pub max_frames: Option<usize>,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub ffmpeg_threads: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub public_base_url: String,
    pub max_upload_bytes: usize,
    pub max_concurrent_runs: usize,
    pub max_retained_runs: usize,
    pub run_retention: Duration,
    pub retention_sweep_interval: Duration,
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let positive_usize = |key: &str, default: usize| {
            parsed(key)
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let positive_secs = |key: &str, default: u64| {
            parsed(key)
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let unit_f32 = |key: &str, default: f32| {
            parsed(key)
                .and_then(|s| s.parse::<f32>().ok())
                .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
                .unwrap_or(default)
        };

        let public_base_url = parsed("PUBLIC_BASE_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let model = ModelConfig {
            backend: parsed("DETECTOR_BACKEND")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DetectorBackend::Yolo),
            model_path: parsed("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_size: parsed("MODEL_INPUT_SIZE")
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|v| *v >= 32 && v % 32 == 0)
                .unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
            confidence_threshold: unit_f32("CONFIDENCE_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD),
            iou_threshold: unit_f32("IOU_THRESHOLD", DEFAULT_IOU_THRESHOLD),
            max_detections: positive_usize("MAX_DETECTIONS", DEFAULT_MAX_DETECTIONS),
        };

        let sampling = SamplingConfig {
            interval_secs: parsed("FRAME_INTERVAL_SECS")
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(DEFAULT_FRAME_INTERVAL_SECS),
            max_frames: parsed("MAX_FRAMES_PER_RUN")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|v| *v > 0),
            ffmpeg_bin: parsed("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: parsed("FFPROBE_BIN").unwrap_or_else(|| "ffprobe".to_string()),
            ffmpeg_threads: positive_usize("FFMPEG_THREADS", DEFAULT_FFMPEG_THREADS),
        };

        Config {
            bind_host: parsed("BIND_HOST").unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            port: parsed("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            data_dir: parsed("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            public_base_url,
            max_upload_bytes: positive_usize("MAX_UPLOAD_BYTES", MAX_VIDEO_UPLOAD_SIZE),
            max_concurrent_runs: positive_usize("MAX_CONCURRENT_RUNS", DEFAULT_MAX_CONCURRENT_RUNS),
            max_retained_runs: positive_usize("MAX_RETAINED_RUNS", DEFAULT_MAX_RETAINED_RUNS),
            run_retention: Duration::from_secs(positive_secs(
                "RUN_RETENTION_SECS",
                DEFAULT_RUN_RETENTION_SECS,
            )),
            retention_sweep_interval: Duration::from_secs(positive_secs(
                "RETENTION_SWEEP_SECS",
                DEFAULT_RETENTION_SWEEP_SECS,
            )),
            model,
            sampling,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Root directory holding one sub-directory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 5000);
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
        assert_eq!(config.public_base_url, "http://localhost:5000");
        assert_eq!(config.model.backend, DetectorBackend::Yolo);
        assert_eq!(config.model.input_size, 640);
        assert_eq!(config.sampling.interval_secs, 1.0);
        assert_eq!(config.sampling.max_frames, None);
        assert_eq!(config.max_concurrent_runs, 1);
        assert_eq!(config.max_retained_runs, 1);
        assert_eq!(config.max_upload_bytes, MAX_VIDEO_UPLOAD_SIZE);
        assert_eq!(config.runs_dir(), PathBuf::from("data").join("runs"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("PUBLIC_BASE_URL", "https://detect.example.com/"),
            ("DETECTOR_BACKEND", "Stub"),
            ("FRAME_INTERVAL_SECS", "0.5"),
            ("MAX_FRAMES_PER_RUN", "12"),
            ("CONFIDENCE_THRESHOLD", "0.4"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.public_base_url, "https://detect.example.com");
        assert_eq!(config.model.backend, DetectorBackend::Stub);
        assert_eq!(config.sampling.interval_secs, 0.5);
        assert_eq!(config.sampling.max_frames, Some(12));
        assert_eq!(config.model.confidence_threshold, 0.4);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("FRAME_INTERVAL_SECS", "-2"),
            ("MAX_CONCURRENT_RUNS", "0"),
            ("IOU_THRESHOLD", "1.5"),
            ("MODEL_INPUT_SIZE", "100"),
            ("DETECTOR_BACKEND", "mystery"),
        ]);
        assert_eq!(config.port, 5000);
        assert_eq!(config.sampling.interval_secs, 1.0);
        assert_eq!(config.max_concurrent_runs, 1);
        assert_eq!(config.model.iou_threshold, 0.45);
        assert_eq!(config.model.input_size, 640);
        assert_eq!(config.model.backend, DetectorBackend::Yolo);
    }
}
