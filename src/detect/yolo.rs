use anyhow::{Context, Result, anyhow};
use image::{Rgb, RgbImage, imageops::FilterType};
use std::path::Path;
use tract_onnx::prelude::*;

use super::{Detection, Detector, non_max_suppression};
use crate::config::ModelConfig;

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Grey used by the ultralytics letterbox
const PAD_VALUE: u8 = 114;

/// Post-processing thresholds
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

/// Mapping from model input space back to the source frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
            width,
            height,
        }
    }

    fn unmap_x(&self, x: f32) -> f32 {
        ((x - self.pad_x) / self.scale).clamp(0.0, self.width as f32)
    }

    fn unmap_y(&self, y: f32) -> f32 {
        ((y - self.pad_y) / self.scale).clamp(0.0, self.height as f32)
    }
}

/// YOLO detector running an ONNX export through tract.
///
/// Accepts both head layouts: `[1, N, 5 + C]` with an objectness column
/// (classic YOLOv5) and `[1, 4 + C, N]` without one (ultralytics v5u/v8).
pub struct YoloDetector {
    model: YoloPlan,
    input_size: u32,
    params: DecodeParams,
}

impl YoloDetector {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        Self::from_path(
            &config.model_path,
            config.input_size,
            DecodeParams {
                confidence_threshold: config.confidence_threshold,
                iou_threshold: config.iou_threshold,
                max_detections: config.max_detections,
            },
        )
    }

    pub fn from_path(model_path: &Path, input_size: u32, params: DecodeParams) -> Result<Self> {
        log::info!("[yolo] Loading model from {}", model_path.display());

        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!("[yolo] Model ready ({}x{} input)", input_size, input_size);

        Ok(Self {
            model,
            input_size,
            params,
        })
    }

    fn build_input(&self, image: &RgbImage) -> (Tensor, Letterbox) {
        let (width, height) = image.dimensions();
        let size = self.input_size;
        let letterbox = Letterbox::fit(width, height, size);

        let new_w = ((width as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
        image::imageops::overlay(
            &mut canvas,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });

        (input.into_tensor(), letterbox)
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("empty frame"));
        }

        let (input, letterbox) = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;

        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not three-dimensional")?;

        decode_predictions(view, &letterbox, self.params)
    }
}

/// Turn raw head output into boxes in source-frame pixels.
pub fn decode_predictions(
    output: tract_ndarray::ArrayView3<f32>,
    letterbox: &Letterbox,
    params: DecodeParams,
) -> Result<Vec<Detection>> {
    let (_, d1, d2) = output.dim();
    let channel_major = d1 < d2;
    let (anchors, attrs) = if channel_major { (d2, d1) } else { (d1, d2) };
    let class_offset = if channel_major { 4 } else { 5 };

    if attrs <= class_offset {
        return Err(anyhow!(
            "unexpected YOLO output shape {:?}",
            output.shape()
        ));
    }

    let value = |anchor: usize, attr: usize| {
        if channel_major {
            output[[0, attr, anchor]]
        } else {
            output[[0, anchor, attr]]
        }
    };

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let objectness = if channel_major { 1.0 } else { value(anchor, 4) };
        if objectness < params.confidence_threshold {
            continue;
        }

        let (class_id, class_score) = (class_offset..attrs)
            .map(|attr| (attr - class_offset, value(anchor, attr)))
            .fold((0, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 { cur } else { best }
            });

        let confidence = objectness * class_score;
        if !confidence.is_finite() || confidence < params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (
            value(anchor, 0),
            value(anchor, 1),
            value(anchor, 2),
            value(anchor, 3),
        );
        let detection = Detection {
            x1: letterbox.unmap_x(cx - w / 2.0),
            y1: letterbox.unmap_y(cy - h / 2.0),
            x2: letterbox.unmap_x(cx + w / 2.0),
            y2: letterbox.unmap_y(cy + h / 2.0),
            confidence,
            class_id: class_id as u32,
        };
        if detection.area() > 0.0 {
            candidates.push(detection);
        }
    }

    Ok(non_max_suppression(
        candidates,
        params.iou_threshold,
        params.max_detections,
    ))
}
