//! Per-camera control loop.
//!
//! A `CameraWorker` runs on its own thread and exclusively owns its frame
//! source, detector and zone tracker. Everything other threads need to see
//! (entries, the last frame for the debug overlay, zone updates, the stop
//! flag) lives in `WorkerShared` behind an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::classify::VisualClassifier;
use crate::detect::{DetectionBox, VehicleDetector};
use crate::frame::Frame;
use crate::ingest::{ReconnectPolicy, SourceSupervisor};
use crate::plate::PlateResolver;
use crate::zone::{Zone, ZoneTracker};
use crate::{round_score, Category, Clock, Entry, Origin};

/// Seconds a committed entry stays highlighted on the debug overlay.
pub const RECENT_OVERLAY_SECS: f64 = 10.0;

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    /// Run the detector on every Nth frame, reusing boxes in between.
    pub detect_every: u32,
    pub reconnect: ReconnectPolicy,
    /// Interval between health log lines.
    pub health_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            detect_every: 1,
            reconnect: ReconnectPolicy::default(),
            health_interval: Duration::from_secs(60),
        }
    }
}

/// Last decoded frame and the boxes in effect for it.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    pub frame: Arc<Frame>,
    pub boxes: Vec<DetectionBox>,
}

/// Geometry of a recently committed entry, kept for the overlay only.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecentEntry {
    pub bbox: DetectionBox,
    pub category: Category,
    pub ts: f64,
}

/// State a worker shares with the service and debug streams.
pub struct WorkerShared {
    source_id: String,
    stop: AtomicBool,
    running: AtomicBool,
    zones: RwLock<Vec<Zone>>,
    pending_zones: Mutex<Option<Vec<Zone>>>,
    entries: RwLock<Vec<Entry>>,
    snapshot: Mutex<Option<FrameSnapshot>>,
    recent: Mutex<Vec<RecentEntry>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("worker {} lock poisoned", what))
}

impl WorkerShared {
    pub fn new(source_id: impl Into<String>, zones: Vec<Zone>) -> Self {
        Self {
            source_id: source_id.into(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            zones: RwLock::new(zones),
            pending_zones: Mutex::new(None),
            entries: RwLock::new(Vec::new()),
            snapshot: Mutex::new(None),
            recent: Mutex::new(Vec::new()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// False once the worker thread has left its loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn zones(&self) -> Result<Vec<Zone>> {
        self.zones
            .read()
            .map(|z| z.clone())
            .map_err(|_| anyhow!("worker zones lock poisoned"))
    }

    /// Replace the zone set. The worker resets every zone state on its next
    /// frame.
    pub fn replace_zones(&self, zones: Vec<Zone>) -> Result<()> {
        *self
            .zones
            .write()
            .map_err(|_| anyhow!("worker zones lock poisoned"))? = zones.clone();
        *lock(&self.pending_zones, "pending zones")? = Some(zones);
        Ok(())
    }

    fn take_pending_zones(&self) -> Result<Option<Vec<Zone>>> {
        Ok(lock(&self.pending_zones, "pending zones")?.take())
    }

    /// Entries with `ts >= since`, oldest first.
    pub fn entries_since(&self, since: f64) -> Result<Vec<Entry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("worker entries lock poisoned"))?;
        Ok(entries.iter().filter(|e| e.ts >= since).cloned().collect())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    fn append(&self, bbox: DetectionBox, entry: Entry) -> Result<()> {
        {
            let mut recent = lock(&self.recent, "recent")?;
            recent.retain(|r| entry.ts - r.ts < RECENT_OVERLAY_SECS);
            recent.push(RecentEntry {
                bbox,
                category: entry.category,
                ts: entry.ts,
            });
        }
        self.entries
            .write()
            .map_err(|_| anyhow!("worker entries lock poisoned"))?
            .push(entry);
        Ok(())
    }

    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.snapshot.lock().ok().and_then(|s| s.clone())
    }

    fn publish(&self, snapshot: FrameSnapshot) -> Result<()> {
        *lock(&self.snapshot, "snapshot")? = Some(snapshot);
        Ok(())
    }

    /// Entries committed less than ten seconds before `now`.
    pub fn recent_for_overlay(&self, now: f64) -> Vec<RecentEntry> {
        match self.recent.lock() {
            Ok(mut recent) => {
                recent.retain(|r| now - r.ts < RECENT_OVERLAY_SECS);
                recent.clone()
            }
            Err(_) => Vec::new(),
        }
    }
}

/// One camera's pipeline.
pub struct CameraWorker {
    shared: Arc<WorkerShared>,
    supervisor: SourceSupervisor,
    detector: VehicleDetector,
    tracker: ZoneTracker,
    resolver: Arc<PlateResolver>,
    classifier: Arc<dyn VisualClassifier>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    frame_index: u64,
    last_boxes: Vec<DetectionBox>,
}

impl CameraWorker {
    pub fn new(
        shared: Arc<WorkerShared>,
        supervisor: SourceSupervisor,
        detector: VehicleDetector,
        resolver: Arc<PlateResolver>,
        classifier: Arc<dyn VisualClassifier>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        let zones = shared.zones().unwrap_or_default();
        let tracker = ZoneTracker::new(zones, clock.now());
        Self {
            shared,
            supervisor,
            detector,
            tracker,
            resolver,
            classifier,
            clock,
            settings,
            frame_index: 0,
            last_boxes: Vec::new(),
        }
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Loop until stopped, then release the source.
    pub fn run(mut self) {
        info!(
            "worker: starting {} (detector {}, {} zones)",
            self.supervisor.describe(),
            self.detector.backend_name(),
            self.tracker.zones().len()
        );
        self.supervisor.start();
        let mut last_health = Instant::now();

        while !self.shared.stop_requested() {
            if let Some(frame) = self.supervisor.next_frame(self.shared.stop_flag()) {
                if let Err(err) = self.process_frame(frame) {
                    warn!("worker: {} frame failed: {:#}", self.shared.source_id(), err);
                }
            }
            if last_health.elapsed() >= self.settings.health_interval {
                let stats = self.supervisor.stats();
                info!(
                    "worker: {} health frames={} failed_reads={} reopens={} entries={}",
                    self.supervisor.describe(),
                    stats.frames,
                    stats.failed_reads,
                    stats.reopens,
                    self.shared.entry_count()
                );
                last_health = Instant::now();
            }
        }

        self.supervisor.release();
        self.shared.running.store(false, Ordering::SeqCst);
        info!("worker: stopped {}", self.supervisor.describe());
    }

    /// Detect, track and commit entries for one frame. Returns the entries
    /// committed on this frame.
    pub fn process_frame(&mut self, frame: Frame) -> Result<Vec<Entry>> {
        let now = self.clock.now();
        if let Some(zones) = self.shared.take_pending_zones()? {
            info!(
                "worker: {} zones replaced ({} zones)",
                self.shared.source_id(),
                zones.len()
            );
            self.tracker.replace_zones(zones, now);
        }

        let frame = Arc::new(frame);
        let stride = self.settings.detect_every.max(1) as u64;
        if self.frame_index % stride == 0 {
            self.last_boxes = self.detector.detect(&frame);
        }
        self.frame_index += 1;

        let (width, height) = (frame.width(), frame.height());
        let source_id = self.shared.source_id().to_string();
        let resolver = self.resolver.as_ref();
        let classifier = self.classifier.as_ref();
        let committed = self
            .tracker
            .evaluate(&self.last_boxes, width, height, now, |bbox| {
                build_entry(&frame, bbox, now, &source_id, resolver, classifier)
            });

        let mut entries = Vec::with_capacity(committed.len());
        for (bbox, entry) in committed {
            info!(
                "worker: entry {} plate={} category={} origin={} score={}",
                entry.source,
                entry.plate.as_deref().unwrap_or("-"),
                entry.category,
                entry.origin.as_str(),
                entry.score
            );
            self.shared.append(bbox, entry.clone())?;
            entries.push(entry);
        }

        self.shared.publish(FrameSnapshot {
            frame,
            boxes: self.last_boxes.clone(),
        })?;
        Ok(entries)
    }
}

/// Attribute a detection and assemble its entry.
///
/// Returns `None` when no plate is read: an entry is never committed without
/// one. The classifier runs when the registry did not know the plate or left
/// brand, model or category blank, and only fills the blanks.
pub fn build_entry(
    frame: &Frame,
    bbox: &DetectionBox,
    ts: f64,
    source: &str,
    resolver: &PlateResolver,
    classifier: &dyn VisualClassifier,
) -> Option<Entry> {
    let crop = frame.crop_vehicle(bbox)?;
    let plate_match = match resolver.resolve(&crop) {
        Ok(Some(m)) => m,
        Ok(None) => {
            debug!("worker: {} no plate read", source);
            return None;
        }
        Err(err) => {
            warn!("worker: {} plate resolution failed: {:#}", source, err);
            return None;
        }
    };
    if plate_match.plate.is_empty() {
        return None;
    }

    let mut origin = if plate_match.found {
        Origin::Etecnic
    } else {
        Origin::PlateOcr
    };
    let mut brand = plate_match.brand;
    let mut model = plate_match.model;
    let mut category = plate_match.category;
    let mut score = plate_match.score;

    let incomplete = brand.is_none() || model.is_none() || category.is_none();
    if !plate_match.found || incomplete {
        let verdict = classifier.classify(&crop);
        brand = brand.or(verdict.brand);
        model = model.or(verdict.model);
        category = category.or(Some(verdict.category));
        score = score.max(verdict.score);
        origin = origin.with_ai();
    }

    Some(Entry {
        ts,
        source: source.to_string(),
        brand,
        model,
        category: category.unwrap_or(Category::Indeterminado),
        score: round_score(score),
        plate: Some(plate_match.plate),
        origin,
    })
}
