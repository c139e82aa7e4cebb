mod backend;
mod backends;
mod result;

use std::path::PathBuf;

use log::{debug, info, warn};

use crate::frame::Frame;

pub use backend::DetectorBackend;
pub use backends::motion::{min_motion_area, MOTION_CONFIDENCE};
pub use backends::{MotionBackend, StubBackend};
pub use result::{
    box_iou, is_vehicle_class, non_max_suppression, DetectionBox, CLASS_BUS, CLASS_CAR,
    CLASS_TRUCK, VEHICLE_CLASSES,
};

#[cfg(feature = "backend-tract")]
pub use backends::TractYoloBackend;

/// Default square input side for the YOLO model.
pub const DEFAULT_IMGSZ: u32 = 512;

/// How a worker builds its detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    /// ONNX weights for the primary model. `None` selects motion only.
    pub weights: Option<PathBuf>,
    pub imgsz: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            weights: None,
            imgsz: DEFAULT_IMGSZ,
        }
    }
}

/// Vehicle detector for one camera.
///
/// The variant is fixed when the detector is built: either a primary model
/// with the motion backend standing by for frames the model fails on, or
/// motion detection alone.
pub enum VehicleDetector {
    Primary {
        primary: Box<dyn DetectorBackend>,
        fallback: MotionBackend,
    },
    Fallback(MotionBackend),
}

impl VehicleDetector {
    pub fn with_primary(primary: Box<dyn DetectorBackend>) -> Self {
        VehicleDetector::Primary {
            primary,
            fallback: MotionBackend::new(),
        }
    }

    pub fn motion_only() -> Self {
        VehicleDetector::Fallback(MotionBackend::new())
    }

    /// Build from settings, degrading to motion when the model cannot load.
    pub fn from_settings(settings: &DetectorSettings) -> Self {
        let Some(weights) = settings.weights.as_ref() else {
            info!("detector: no model weights configured, using motion fallback");
            return Self::motion_only();
        };
        Self::load_primary(weights, settings.imgsz)
    }

    #[cfg(feature = "backend-tract")]
    fn load_primary(weights: &std::path::Path, imgsz: u32) -> Self {
        match TractYoloBackend::new(weights, imgsz) {
            Ok(mut backend) => {
                if let Err(err) = backend.warm_up() {
                    warn!("detector: warm-up failed: {:#}", err);
                }
                info!(
                    "detector: loaded {} (imgsz {})",
                    weights.display(),
                    imgsz
                );
                Self::with_primary(Box::new(backend))
            }
            Err(err) => {
                warn!(
                    "detector: failed to load {}: {:#}; using motion fallback",
                    weights.display(),
                    err
                );
                Self::motion_only()
            }
        }
    }

    #[cfg(not(feature = "backend-tract"))]
    fn load_primary(weights: &std::path::Path, _imgsz: u32) -> Self {
        warn!(
            "detector: weights {} configured but built without backend-tract; using motion fallback",
            weights.display()
        );
        Self::motion_only()
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            VehicleDetector::Primary { primary, .. } => primary.name(),
            VehicleDetector::Fallback(motion) => motion.name(),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, VehicleDetector::Primary { .. })
    }

    /// Vehicle boxes for one frame. Never fails: an erroring frame yields an
    /// empty set.
    pub fn detect(&mut self, frame: &Frame) -> Vec<DetectionBox> {
        match self {
            VehicleDetector::Primary { primary, fallback } => match primary.detect(frame) {
                Ok(boxes) => boxes
                    .into_iter()
                    .filter(|b| is_vehicle_class(b.class_id))
                    .collect(),
                Err(err) => {
                    debug!("detector: {} failed on frame: {:#}", primary.name(), err);
                    run_motion(fallback, frame)
                }
            },
            VehicleDetector::Fallback(motion) => run_motion(motion, frame),
        }
    }
}

fn run_motion(motion: &mut MotionBackend, frame: &Frame) -> Vec<DetectionBox> {
    motion.detect(frame).unwrap_or_else(|err| {
        debug!("detector: motion fallback failed: {:#}", err);
        Vec::new()
    })
}
