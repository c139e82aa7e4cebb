use anyhow::Result;
use image::imageops;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{dilate, open};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{DetectionBox, CLASS_CAR};
use crate::frame::Frame;

/// Confidence reported for every motion box.
pub const MOTION_CONFIDENCE: f32 = 0.4;

const MIN_AREA_FLOOR: i64 = 4000;
const MIN_AREA_FRACTION: f64 = 0.0015;
const DEFAULT_HISTORY: u32 = 300;
const DEFAULT_DIFF_THRESHOLD: f32 = 25.0;

/// Smallest box area (px²) the motion backend reports for a frame size.
pub fn min_motion_area(width: u32, height: u32) -> i64 {
    let proportional = (MIN_AREA_FRACTION * width as f64 * height as f64) as i64;
    proportional.max(MIN_AREA_FLOOR)
}

/// Background-subtraction backend used when no detection model is available.
///
/// Keeps a running-average grey background, thresholds the absolute
/// difference, cleans the mask with a median blur plus morphological
/// open/dilate, and reports the bounding boxes of external contours.
pub struct MotionBackend {
    background: Option<Background>,
    learning_rate: f32,
    threshold: f32,
}

struct Background {
    width: u32,
    height: u32,
    mean: Vec<f32>,
}

impl Background {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            mean: gray.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    /// Foreground mask against the current model, then fold the frame in.
    fn foreground(&mut self, gray: &GrayImage, threshold: f32, learning_rate: f32) -> GrayImage {
        let mut mask = GrayImage::new(self.width, self.height);
        for ((value, mean), out) in gray
            .as_raw()
            .iter()
            .zip(self.mean.iter_mut())
            .zip(mask.iter_mut())
        {
            let value = *value as f32;
            if (value - *mean).abs() > threshold {
                *out = 255;
            }
            *mean += learning_rate * (value - *mean);
        }
        mask
    }
}

impl MotionBackend {
    pub fn new() -> Self {
        Self {
            background: None,
            learning_rate: 1.0 / DEFAULT_HISTORY as f32,
            threshold: DEFAULT_DIFF_THRESHOLD,
        }
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        let gray = imageops::grayscale(frame.image());
        let (width, height) = gray.dimensions();

        let model_matches = matches!(
            &self.background,
            Some(bg) if bg.width == width && bg.height == height
        );
        if !model_matches {
            self.background = Some(Background::from_gray(&gray));
            return Ok(Vec::new());
        }
        let Some(background) = self.background.as_mut() else {
            return Ok(Vec::new());
        };

        let mask = background.foreground(&gray, self.threshold, self.learning_rate);
        let mask = median_filter(&mask, 2, 2);
        let mask = open(&mask, Norm::LInf, 4);
        let mask = dilate(&mask, Norm::LInf, 4);

        let min_area = min_motion_area(width, height);
        let boxes = find_contours::<i32>(&mask)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .filter_map(|c| {
                let first = c.points.first()?;
                let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
                for p in &c.points {
                    x0 = x0.min(p.x);
                    y0 = y0.min(p.y);
                    x1 = x1.max(p.x);
                    y1 = y1.max(p.y);
                }
                let bbox = DetectionBox {
                    x: x0,
                    y: y0,
                    w: x1 - x0 + 1,
                    h: y1 - y0 + 1,
                    confidence: MOTION_CONFIDENCE,
                    class_id: CLASS_CAR,
                };
                (bbox.area() >= min_area).then_some(bbox)
            })
            .collect();
        Ok(boxes)
    }
}
