//! Debug overlay rendering.
//!
//! Draws a worker's zones, the detections overlapping them and the entries
//! committed in the last few seconds onto its latest frame, then streams the
//! result as `multipart/x-mixed-replace` JPEG parts.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use log::debug;

use crate::frame::{encode_jpeg, Frame};
use crate::worker::{FrameSnapshot, RecentEntry, WorkerShared};
use crate::zone::Zone;
use crate::{Category, Clock};

pub const BOUNDARY: &str = "frame";

pub const DEFAULT_MAX_WIDTH: u32 = 960;
pub const DEFAULT_QUALITY: u8 = 90;

/// Detections are drawn when they overlap some zone at least this much.
const SHOW_DETECTION_IOU: f64 = 0.02;
const PART_INTERVAL: Duration = Duration::from_millis(60);
const NO_FRAME_WAIT: Duration = Duration::from_millis(50);

const ZONE_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const DETECTION_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const EV_COLOR: Rgb<u8> = Rgb([120, 255, 60]);
const PHEV_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const OTHER_COLOR: Rgb<u8> = Rgb([0, 215, 255]);

fn category_color(category: Category) -> Rgb<u8> {
    match category {
        Category::Ev => EV_COLOR,
        Category::Phev => PHEV_COLOR,
        Category::Indeterminado => OTHER_COLOR,
    }
}

/// Rectangle outline `thickness` pixels wide, growing inwards.
fn draw_box(image: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness as i64 {
        let (w, h) = (x1 - x0 - 2 * t, y1 - y0 - 2 * t);
        if w <= 0 || h <= 0 {
            break;
        }
        let (Ok(x), Ok(y), Ok(w), Ok(h)) = (
            i32::try_from(x0 + t),
            i32::try_from(y0 + t),
            u32::try_from(w),
            u32::try_from(h),
        ) else {
            break;
        };
        draw_hollow_rect_mut(image, Rect::at(x, y).of_size(w, h), color);
    }
}

/// Render the overlay for one snapshot at full resolution.
pub fn render(snapshot: &FrameSnapshot, zones: &[Zone], recent: &[RecentEntry]) -> RgbImage {
    let frame = snapshot.frame.as_ref();
    let (w, h) = (frame.width(), frame.height());
    let mut image = frame.image().clone();

    let rects: Vec<_> = zones.iter().map(|z| z.pixel_rect(w, h)).collect();
    for r in &rects {
        draw_box(&mut image, r.x0, r.y0, r.x1, r.y1, ZONE_COLOR, 2);
    }
    for b in &snapshot.boxes {
        if rects.iter().any(|r| r.iou(b) >= SHOW_DETECTION_IOU) {
            let (x, y) = (b.x as i64, b.y as i64);
            draw_box(&mut image, x, y, x + b.w as i64, y + b.h as i64, DETECTION_COLOR, 1);
        }
    }
    for entry in recent {
        let b = entry.bbox;
        let (x, y) = (b.x as i64, b.y as i64);
        draw_box(
            &mut image,
            x,
            y,
            x + b.w as i64,
            y + b.h as i64,
            category_color(entry.category),
            3,
        );
    }
    image
}

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// One multipart part carrying a JPEG.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Render, downscale and encode the current overlay. `None` before the first
/// frame.
pub fn overlay_jpeg(shared: &WorkerShared, now: f64, max_width: u32, quality: u8) -> Result<Option<Vec<u8>>> {
    let Some(snapshot) = shared.snapshot() else {
        return Ok(None);
    };
    let zones = shared.zones()?;
    let recent = shared.recent_for_overlay(now);
    let image = Frame::from_image(render(&snapshot, &zones, &recent)).fit_width(max_width);
    encode_jpeg(&image, quality).map(Some)
}

/// Pull-based overlay stream for one worker.
///
/// Yields multipart parts at most every 60 ms, waits while no frame has
/// been decoded yet and ends once the worker is asked to stop.
pub struct OverlayStream {
    shared: Arc<WorkerShared>,
    clock: Arc<dyn Clock>,
    max_width: u32,
    quality: u8,
    last_part_at: Option<Instant>,
}

impl OverlayStream {
    pub fn new(shared: Arc<WorkerShared>, clock: Arc<dyn Clock>, max_width: u32, quality: u8) -> Self {
        Self {
            shared,
            clock,
            max_width,
            quality: quality.clamp(1, 100),
            last_part_at: None,
        }
    }
}

impl Iterator for OverlayStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if let Some(last) = self.last_part_at {
            let elapsed = last.elapsed();
            if elapsed < PART_INTERVAL {
                thread::sleep(PART_INTERVAL - elapsed);
            }
        }
        loop {
            if self.shared.stop_requested() || !self.shared.is_running() {
                return None;
            }
            match overlay_jpeg(&self.shared, self.clock.now(), self.max_width, self.quality) {
                Ok(Some(jpeg)) => {
                    self.last_part_at = Some(Instant::now());
                    return Some(multipart_part(&jpeg));
                }
                Ok(None) => thread::sleep(NO_FRAME_WAIT),
                Err(err) => {
                    debug!("overlay: {} render failed: {:#}", self.shared.source_id(), err);
                    thread::sleep(NO_FRAME_WAIT);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionBox;

    fn snapshot(boxes: Vec<DetectionBox>) -> FrameSnapshot {
        FrameSnapshot {
            frame: Arc::new(Frame::filled(200, 100, [0, 0, 0])),
            boxes,
        }
    }

    fn b(x: i32, y: i32, w: i32, h: i32) -> DetectionBox {
        DetectionBox {
            x,
            y,
            w,
            h,
            confidence: 0.9,
            class_id: 2,
        }
    }

    #[test]
    fn draws_zones_and_overlapping_detections_only() {
        let zone = Zone::new(0.0, 0.0, 0.5, 1.0).unwrap();
        let image = render(&snapshot(vec![b(10, 10, 40, 40), b(150, 10, 40, 40)]), &[zone], &[]);
        assert_eq!(*image.get_pixel(0, 50), ZONE_COLOR);
        assert_eq!(*image.get_pixel(1, 50), ZONE_COLOR);
        assert_eq!(*image.get_pixel(2, 50), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(10, 30), DETECTION_COLOR);
        assert_eq!(*image.get_pixel(150, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn recent_entries_use_category_colours() {
        let recent = [RecentEntry {
            bbox: b(120, 20, 60, 60),
            category: Category::Phev,
            ts: 0.0,
        }];
        let image = render(&snapshot(Vec::new()), &[], &recent);
        assert_eq!(*image.get_pixel(120, 50), PHEV_COLOR);
        assert_eq!(*image.get_pixel(122, 50), PHEV_COLOR);
        assert_eq!(*image.get_pixel(123, 50), Rgb([0, 0, 0]));
        assert_eq!(category_color(Category::Indeterminado), OTHER_COLOR);
    }

    #[test]
    fn part_framing() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=frame");
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn overlay_waits_for_first_frame() -> Result<()> {
        let shared = WorkerShared::new("cam", Vec::new());
        assert!(overlay_jpeg(&shared, 0.0, 960, 90)?.is_none());
        Ok(())
    }

    #[test]
    fn stream_ends_when_worker_stops() {
        let shared = Arc::new(WorkerShared::new("cam", Vec::new()));
        shared.request_stop();
        let mut stream = OverlayStream::new(shared, Arc::new(crate::SystemClock), 960, 90);
        assert!(stream.next().is_none());
    }
}
