//! Object detection.
//!
//! The model is an opaque capability behind [`Detector`]: an RGB image goes
//! in, bounding boxes in source-image pixel coordinates come out. The
//! pipeline never depends on a concrete backend.

use anyhow::Result;
use image::RgbImage;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{DetectorBackend, ModelConfig};

mod annotate;
mod stub;
mod yolo;

pub use annotate::draw_detections;
pub use stub::StubDetector;
pub use yolo::YoloDetector;

/// One bounding box with its confidence and class id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    /// `[x1, y1, x2, y2, confidence, class_id]`
    pub fn to_row(&self) -> [f32; 6] {
        [
            self.x1,
            self.y1,
            self.x2,
            self.y2,
            self.confidence,
            self.class_id as f32,
        ]
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

/// Pluggable detection model, shared read-only across runs
pub trait Detector: Send + Sync {
    /// Backend identifier for logs
    fn name(&self) -> &'static str;

    /// Detect objects in one frame
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Build the configured detector. Called once at startup.
pub fn load_detector(config: &ModelConfig) -> Result<Arc<dyn Detector>> {
    let detector: Arc<dyn Detector> = match config.backend {
        DetectorBackend::Yolo => Arc::new(YoloDetector::load(config)?),
        DetectorBackend::Stub => Arc::new(StubDetector::default()),
    };
    log::info!("[detect] Using {} detector", detector.name());
    Ok(detector)
}

/// Class-wise greedy NMS. Output is sorted by confidence, highest first.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    #[test]
    fn test_row_layout() {
        let d = det(1.0, 2.0, 3.0, 4.0, 0.5, 7);
        assert_eq!(d.to_row(), [1.0, 2.0, 3.0, 4.0, 0.5, 7.0]);
    }

    #[test]
    fn test_iou() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = det(5.0, 0.0, 15.0, 10.0, 0.9, 0);
        let c = det(20.0, 20.0, 30.0, 30.0, 0.9, 0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![
                det(0.0, 0.0, 10.0, 10.0, 0.6, 0),
                det(1.0, 1.0, 11.0, 11.0, 0.9, 0),
                det(1.0, 1.0, 11.0, 11.0, 0.8, 2),
                det(50.0, 50.0, 60.0, 60.0, 0.7, 0),
            ],
            0.45,
            300,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_nms_respects_max_detections() {
        let candidates = (0..10)
            .map(|i| det(i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0, 0.5, 0))
            .collect();
        assert_eq!(non_max_suppression(candidates, 0.45, 4).len(), 4);
    }

    #[test]
    fn test_load_stub_detector() {
        let config = crate::config::Config::from_lookup(|key| {
            (key == "DETECTOR_BACKEND").then(|| "stub".to_string())
        });
        let detector = load_detector(&config.model).unwrap();
        assert_eq!(detector.name(), "stub");
    }
}
