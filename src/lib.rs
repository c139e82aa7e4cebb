//! Vehicle entry watcher
//!
//! This crate implements the real-time vehicle-entry pipeline: it watches live
//! camera feeds, decides when a vehicle newly occupies a configured zone, reads
//! its license plate, resolves the vehicle through an external registry and
//! falls back to a visual classifier when the registry has nothing useful.
//!
//! # Architecture
//!
//! Data flows one way per frame:
//!
//! `FrameSource` → `VehicleDetector` → `ZoneTracker` → (new entry) →
//! `PlateResolver` (+ `VisualClassifier` fallback) → `Entry` → `VisionService`.
//!
//! # Module Structure
//!
//! - `frame`: Decoded RGB frames, crops and JPEG encoding
//! - `ingest`: Frame sources (RTSP, HTTP MJPEG, synthetic) and reconnect supervision
//! - `detect`: Vehicle detection backends (ONNX primary, motion fallback)
//! - `zone`: Zone geometry and the per-camera occupancy state machine
//! - `plate`: Plate reading, registry lookups and the shared TTL cache
//! - `classify`: Prompt-similarity classifier used when the registry falls short
//! - `worker`: Per-camera control loop
//! - `overlay`: Debug MJPEG rendering
//! - `service`: Worker registry and query surface
//! - `api`: HTTP endpoints over the service
//! - `config`: Daemon configuration (file + environment)

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod classify;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod plate;
pub mod service;
pub mod worker;
pub mod zone;

pub use classify::{Classification, PromptClassifier, UnavailableClassifier, VisualClassifier};
pub use detect::{DetectionBox, DetectorBackend, MotionBackend, StubBackend, VehicleDetector};
pub use frame::Frame;
pub use ingest::{FrameSource, MjpegSource, ReconnectPolicy, RtspSource, SourceSupervisor};
pub use plate::{PlateMatch, PlateReader, PlateResolver, RegistryClient};
pub use service::{PipelineFactory, StartOutcome, Summary, VisionService};
pub use worker::{CameraWorker, WorkerSettings, WorkerShared};
pub use zone::{Zone, ZoneState, ZoneTracker};

// -------------------- Time --------------------

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Wall-clock source for entry timestamps, cache TTLs and zone rearm windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        now_epoch_secs()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

// -------------------- Categories --------------------

/// Propulsion category attached to every committed entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Category {
    #[serde(rename = "EV")]
    Ev,
    #[serde(rename = "PHEV")]
    Phev,
    #[serde(rename = "indeterminado")]
    Indeterminado,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ev => "EV",
            Category::Phev => "PHEV",
            Category::Indeterminado => "indeterminado",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the attribution of an entry came from.
///
/// - `Etecnic`: registry hit with complete data
/// - `PlateOcr`: plate read but not in the registry, classifier unused
/// - `EtecnicAi`: registry hit completed by the classifier
/// - `Ai`: plate read, registry miss, attribution from the classifier
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Etecnic,
    PlateOcr,
    EtecnicAi,
    Ai,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Etecnic => "etecnic",
            Origin::PlateOcr => "plate_ocr",
            Origin::EtecnicAi => "etecnic_ai",
            Origin::Ai => "ai",
        }
    }

    /// Origin once the classifier has contributed to the attribution.
    pub fn with_ai(self) -> Self {
        match self {
            Origin::Etecnic | Origin::EtecnicAi => Origin::EtecnicAi,
            Origin::PlateOcr | Origin::Ai => Origin::Ai,
        }
    }
}

// -------------------- Entries --------------------

/// A committed detection + attribution event. Never mutated after creation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub ts: f64,
    pub source: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Category,
    pub score: f64,
    pub plate: Option<String>,
    pub origin: Origin,
}

/// Round a score to four decimals, the precision reported to consumers.
pub fn round_score(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_serializes_to_wire_labels() {
        let labels: Vec<String> = [Category::Ev, Category::Phev, Category::Indeterminado]
            .iter()
            .map(|c| serde_json::to_string(c).unwrap())
            .collect();
        assert_eq!(labels, vec!["\"EV\"", "\"PHEV\"", "\"indeterminado\""]);
    }

    #[test]
    fn origin_with_ai_promotes_tags() {
        assert_eq!(Origin::Etecnic.with_ai(), Origin::EtecnicAi);
        assert_eq!(Origin::PlateOcr.with_ai(), Origin::Ai);
        assert_eq!(Origin::Ai.with_ai(), Origin::Ai);
        assert_eq!(
            serde_json::to_string(&Origin::EtecnicAi).unwrap(),
            "\"etecnic_ai\""
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        clock.advance(2.5);
        assert_eq!(clock.now(), 102.5);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn round_score_keeps_four_decimals() {
        assert_eq!(round_score(0.123_456), 0.1235);
        assert_eq!(round_score(0.8), 0.8);
    }
}
