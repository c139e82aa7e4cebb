#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{is_vehicle_class, non_max_suppression, DetectionBox};
use crate::frame::Frame;

/// Minimum class score kept from the model output.
pub const YOLO_CONFIDENCE: f32 = 0.25;
const NMS_IOU: f64 = 0.45;
const LETTERBOX_FILL: u8 = 114;

/// Tract-based YOLO detector.
///
/// Loads a local ONNX export with a single `[1, 4 + classes, anchors]` output
/// (the usual YOLOv8 layout; the transposed `[1, anchors, 4 + classes]` form
/// is accepted too). Frames are letterboxed into a square input of
/// `input_size` pixels and boxes are mapped back to frame coordinates.
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
}

impl TractYoloBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
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

        Ok(Self {
            model,
            input_size,
            confidence_threshold: YOLO_CONFIDENCE,
        })
    }

    /// Letterbox into the model square. Returns the tensor and the scale used.
    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32)> {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return Err(anyhow!("empty frame"));
        }
        let side = self.input_size;
        let scale = side as f32 / w.max(h) as f32;
        let nw = ((w as f32 * scale) as u32).clamp(1, side);
        let nh = ((h as f32 * scale) as u32).clamp(1, side);
        let resized = imageops::resize(frame.image(), nw, nh, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([LETTERBOX_FILL; 3]));
        imageops::replace(&mut canvas, &resized, 0, 0);

        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        Ok((input.into_tensor(), scale))
    }

    fn decode(&self, outputs: TVec<TValue>, scale: f32) -> Result<Vec<DetectionBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let transposed = shape[1] > shape[2];
        let (channels, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if channels <= 4 {
            return Err(anyhow!("YOLO output has no class channels: {:?}", shape));
        }
        let at = |c: usize, i: usize| {
            if transposed {
                view[[0, i, c]]
            } else {
                view[[0, c, i]]
            }
        };

        let mut boxes = Vec::new();
        for i in 0..anchors {
            let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
            for c in 4..channels {
                let score = at(c, i);
                if score > best_score {
                    best_score = score;
                    best_class = c - 4;
                }
            }
            let class_id = best_class as u32;
            if best_score < self.confidence_threshold || !is_vehicle_class(class_id) {
                continue;
            }
            let (cx, cy, bw, bh) = (at(0, i), at(1, i), at(2, i), at(3, i));
            boxes.push(DetectionBox {
                x: ((cx - bw / 2.0) / scale).round() as i32,
                y: ((cy - bh / 2.0) / scale).round() as i32,
                w: (bw / scale).round() as i32,
                h: (bh / scale).round() as i32,
                confidence: best_score,
                class_id,
            });
        }
        Ok(non_max_suppression(boxes, NMS_IOU))
    }
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        let (input, scale) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, scale)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        self.detect(&Frame::filled(side, side, [LETTERBOX_FILL; 3]))
            .map(|_| ())
    }
}
