use anyhow::Result;
use image::RgbImage;

use super::{Detection, Detector};

/// Model-free detector that reports fixed, centred boxes.
/// For smoke-testing a deployment without a model file.
pub struct StubDetector {
    boxes_per_frame: usize,
}

impl StubDetector {
    pub fn new(boxes_per_frame: usize) -> Self {
        Self { boxes_per_frame }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);

        Ok((0..self.boxes_per_frame)
            .map(|i| {
                // Nested boxes shrinking towards the centre
                let half_w = width as f32 / 4.0 / (i + 1) as f32;
                let half_h = height as f32 / 4.0 / (i + 1) as f32;
                Detection {
                    x1: cx - half_w,
                    y1: cy - half_h,
                    x2: cx + half_w,
                    y2: cy + half_h,
                    confidence: 0.9,
                    class_id: i as u32,
                }
            })
            .collect())
    }
}
