//! Zone geometry and per-camera occupancy tracking.
//!
//! A zone is a normalized rectangle over the frame. Each zone carries a
//! FREE/OCCUPIED state: a vehicle entering a FREE zone produces one entry
//! candidate and marks it OCCUPIED; the zone rearms only after it has stayed
//! empty for longer than the rearm window.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::DetectionBox;

/// Minimum IoU for a box to count toward a zone.
pub const DEFAULT_MIN_IOU: f64 = 0.12;
/// Relaxed IoU used when a zone covers most of the frame.
pub const LARGE_ZONE_MIN_IOU: f64 = 0.02;
/// Zone area fraction above which the relaxed IoU applies.
pub const LARGE_ZONE_FRACTION: f64 = 0.85;
/// Seconds a zone must stay empty before it can count again.
pub const REARM_SECS: f64 = 5.0;

/// Normalized rectangle `(x0, y0, x1, y1)` with `0 <= x0 < x1 <= 1` and the
/// same for y. Serialized as a four-element array.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct Zone {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Zone {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Result<Self> {
        let coords = [x0, y0, x1, y1];
        if coords.iter().any(|c| !c.is_finite() || !(0.0..=1.0).contains(c)) {
            bail!("zone coordinates must lie in [0, 1]: {:?}", coords);
        }
        if x0 >= x1 || y0 >= y1 {
            bail!("zone is empty: {:?}", coords);
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    /// Clamp every coordinate into `[0, 1]`, then validate.
    pub fn clamped(x0: f64, y0: f64, x1: f64, y1: f64) -> Result<Self> {
        let clamp = |v: f64| if v.is_nan() { v } else { v.clamp(0.0, 1.0) };
        Self::new(clamp(x0), clamp(y0), clamp(x1), clamp(y1))
    }

    /// Parse `[[x0,y0,x1,y1], ...]`, clamping coordinates. Any malformed
    /// element rejects the whole list.
    pub fn parse_list(json: &str) -> Result<Vec<Zone>> {
        let value: Value = serde_json::from_str(json).context("zones are not valid JSON")?;
        let items = value
            .as_array()
            .ok_or_else(|| anyhow!("zones must be a JSON array"))?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let coords = item
                    .as_array()
                    .filter(|c| c.len() == 4)
                    .ok_or_else(|| anyhow!("zone {} must have four coordinates", i))?;
                let mut out = [0.0f64; 4];
                for (slot, c) in out.iter_mut().zip(coords) {
                    *slot = c
                        .as_f64()
                        .ok_or_else(|| anyhow!("zone {} has a non-numeric coordinate", i))?;
                }
                Zone::clamped(out[0], out[1], out[2], out[3])
                    .with_context(|| format!("zone {}", i))
            })
            .collect()
    }

    pub fn coords(&self) -> [f64; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }

    /// Pixel rectangle for a frame size (coordinates truncated).
    pub fn pixel_rect(&self, width: u32, height: u32) -> PixelRect {
        let (w, h) = (width as f64, height as f64);
        PixelRect {
            x0: (self.x0 * w) as i64,
            y0: (self.y0 * h) as i64,
            x1: (self.x1 * w) as i64,
            y1: (self.y1 * h) as i64,
        }
    }
}

impl TryFrom<[f64; 4]> for Zone {
    type Error = anyhow::Error;

    fn try_from(c: [f64; 4]) -> Result<Self> {
        Zone::new(c[0], c[1], c[2], c[3])
    }
}

impl From<Zone> for [f64; 4] {
    fn from(zone: Zone) -> Self {
        zone.coords()
    }
}

/// A zone resolved against a concrete frame size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl PixelRect {
    pub fn width(&self) -> i64 {
        (self.x1 - self.x0).max(1)
    }

    pub fn height(&self) -> i64 {
        (self.y1 - self.y0).max(1)
    }

    /// IoU between this rect (at least 1x1) and a detection box.
    pub fn iou(&self, b: &DetectionBox) -> f64 {
        let (ax0, ay0) = (self.x0, self.y0);
        let (ax1, ay1) = (ax0 + self.width(), ay0 + self.height());
        let (bx0, by0) = (b.x as i64, b.y as i64);
        let (bx1, by1) = (bx0 + b.w as i64, by0 + b.h as i64);
        let iw = (ax1.min(bx1) - ax0.max(bx0)).max(0);
        let ih = (ay1.min(by1) - ay0.max(by0)).max(0);
        let inter = iw * ih;
        if inter <= 0 {
            return 0.0;
        }
        let union = self.width() * self.height() + b.area() - inter;
        inter as f64 / union.max(1) as f64
    }

    /// Box center strictly inside the rect.
    pub fn contains_center(&self, b: &DetectionBox) -> bool {
        let (cx, cy) = b.center();
        self.x0 < cx && cx < self.x1 && self.y0 < cy && cy < self.y1
    }

    /// Fraction of the frame covered by the rect.
    pub fn frame_fraction(&self, width: u32, height: u32) -> f64 {
        let frame_area = (width as i64 * height as i64).max(1);
        (self.width() * self.height()) as f64 / frame_area as f64
    }

    pub fn min_iou(&self, width: u32, height: u32) -> f64 {
        if self.frame_fraction(width, height) > LARGE_ZONE_FRACTION {
            LARGE_ZONE_MIN_IOU
        } else {
            DEFAULT_MIN_IOU
        }
    }

    pub fn is_eligible(&self, b: &DetectionBox, min_iou: f64) -> bool {
        self.iou(b) >= min_iou || self.contains_center(b)
    }
}

/// Highest-confidence box eligible for a zone; the first one wins ties.
pub fn best_box_for_zone(
    zone: &Zone,
    boxes: &[DetectionBox],
    width: u32,
    height: u32,
) -> Option<DetectionBox> {
    let rect = zone.pixel_rect(width, height);
    let min_iou = rect.min_iou(width, height);
    best_by_confidence(boxes.iter().filter(|b| rect.is_eligible(b, min_iou)))
}

fn best_by_confidence<'a>(boxes: impl Iterator<Item = &'a DetectionBox>) -> Option<DetectionBox> {
    let mut best: Option<&DetectionBox> = None;
    for b in boxes {
        if best.map_or(true, |current| b.confidence > current.confidence) {
            best = Some(b);
        }
    }
    best.copied()
}

/// Occupancy state of one zone.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoneState {
    pub occupied: bool,
    /// Last frame on which no eligible box was seen.
    pub last_free_at: f64,
    /// Start of the current uninterrupted run of empty frames.
    pub empty_since: Option<f64>,
}

impl ZoneState {
    pub fn new(now: f64) -> Self {
        Self {
            occupied: false,
            last_free_at: now,
            empty_since: None,
        }
    }

    fn observe_empty(&mut self, now: f64, rearm_after: f64) {
        let streak_start = *self.empty_since.get_or_insert(now);
        if self.occupied && now - streak_start > rearm_after {
            self.occupied = false;
        }
        self.last_free_at = now;
    }
}

enum TrackerMode {
    Zoned {
        zones: Vec<Zone>,
        states: Vec<ZoneState>,
    },
    /// No zones configured: the best box of every frame is a candidate.
    Zoneless,
}

/// FREE/OCCUPIED state machine over a camera's zones.
pub struct ZoneTracker {
    mode: TrackerMode,
}

impl ZoneTracker {
    /// An empty zone list selects zoneless mode.
    pub fn new(zones: Vec<Zone>, now: f64) -> Self {
        let mut tracker = Self {
            mode: TrackerMode::Zoneless,
        };
        tracker.replace_zones(zones, now);
        tracker
    }

    /// Swap the zone set. Every state restarts FREE.
    pub fn replace_zones(&mut self, zones: Vec<Zone>, now: f64) {
        self.mode = if zones.is_empty() {
            TrackerMode::Zoneless
        } else {
            let states = vec![ZoneState::new(now); zones.len()];
            TrackerMode::Zoned { zones, states }
        };
    }

    pub fn zones(&self) -> &[Zone] {
        match &self.mode {
            TrackerMode::Zoned { zones, .. } => zones,
            TrackerMode::Zoneless => &[],
        }
    }

    pub fn states(&self) -> &[ZoneState] {
        match &self.mode {
            TrackerMode::Zoned { states, .. } => states,
            TrackerMode::Zoneless => &[],
        }
    }

    pub fn is_zoneless(&self) -> bool {
        matches!(self.mode, TrackerMode::Zoneless)
    }

    /// Advance the state machine by one frame.
    ///
    /// `build` is called for each candidate (a FREE zone's best box, or the
    /// frame's best box in zoneless mode). A zone becomes OCCUPIED only when
    /// `build` returns a value; otherwise it stays FREE and retries on the next
    /// frame.
    pub fn evaluate<T, F>(
        &mut self,
        boxes: &[DetectionBox],
        width: u32,
        height: u32,
        now: f64,
        mut build: F,
    ) -> Vec<(DetectionBox, T)>
    where
        F: FnMut(&DetectionBox) -> Option<T>,
    {
        let mut committed = Vec::new();
        match &mut self.mode {
            TrackerMode::Zoneless => {
                if let Some(best) = best_by_confidence(boxes.iter()) {
                    if let Some(value) = build(&best) {
                        committed.push((best, value));
                    }
                }
            }
            TrackerMode::Zoned { zones, states } => {
                for (zone, state) in zones.iter().zip(states.iter_mut()) {
                    match best_box_for_zone(zone, boxes, width, height) {
                        Some(best) => {
                            state.empty_since = None;
                            if !state.occupied {
                                if let Some(value) = build(&best) {
                                    state.occupied = true;
                                    committed.push((best, value));
                                }
                            }
                        }
                        None => state.observe_empty(now, REARM_SECS),
                    }
                }
            }
        }
        committed
    }
}
