/// COCO class ids the pipeline treats as vehicles.
pub const CLASS_CAR: u32 = 2;
pub const CLASS_BUS: u32 = 5;
pub const CLASS_TRUCK: u32 = 7;

pub const VEHICLE_CLASSES: &[u32] = &[CLASS_CAR, CLASS_BUS, CLASS_TRUCK];

pub fn is_vehicle_class(class_id: u32) -> bool {
    VEHICLE_CLASSES.contains(&class_id)
}

/// One detection in pixel coordinates of the frame it came from.
///
/// Boxes live for a single frame iteration; the worker keeps the last set only
/// for stride reuse and overlay rendering.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub confidence: f32,
    pub class_id: u32,
}

impl DetectionBox {
    /// Integer center, as used by the zone membership test.
    pub fn center(&self) -> (i64, i64) {
        (
            self.x as i64 + (self.w as i64) / 2,
            self.y as i64 + (self.h as i64) / 2,
        )
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }
}

/// Intersection over union of two boxes, `0.0` when either is empty.
pub fn box_iou(a: &DetectionBox, b: &DetectionBox) -> f64 {
    let ix0 = a.x.max(b.x) as i64;
    let iy0 = a.y.max(b.y) as i64;
    let ix1 = (a.x as i64 + a.w as i64).min(b.x as i64 + b.w as i64);
    let iy1 = (a.y as i64 + a.h as i64).min(b.y as i64 + b.h as i64);
    let inter = (ix1 - ix0).max(0) * (iy1 - iy0).max(0);
    let union = a.area() + b.area() - inter;
    if union <= 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// Greedy per-class non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut boxes: Vec<DetectionBox>, iou_threshold: f64) -> Vec<DetectionBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectionBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && box_iou(k, &candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x: i32, y: i32, w: i32, h: i32, confidence: f32, class_id: u32) -> DetectionBox {
        DetectionBox {
            x,
            y,
            w,
            h,
            confidence,
            class_id,
        }
    }

    #[test]
    fn center_uses_integer_halves() {
        assert_eq!(b(10, 20, 5, 7, 0.5, 2).center(), (12, 23));
    }

    #[test]
    fn nms_drops_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![
                b(0, 0, 100, 100, 0.6, CLASS_CAR),
                b(5, 5, 100, 100, 0.9, CLASS_CAR),
                b(5, 5, 100, 100, 0.7, CLASS_TRUCK),
                b(300, 300, 50, 50, 0.3, CLASS_CAR),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|k| k.class_id == CLASS_TRUCK));
    }

    #[test]
    fn vehicle_classes_are_car_bus_truck() {
        assert!(is_vehicle_class(2) && is_vehicle_class(5) && is_vehicle_class(7));
        assert!(!is_vehicle_class(0));
    }
}
