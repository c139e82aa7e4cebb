//! Worker registry and query surface.
//!
//! `VisionService` owns one `CameraWorker` thread per source id. Structural
//! changes (start, stop, zone updates) go through a single registry lock;
//! the workers themselves run independently and only share the plate
//! resolver and classifier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::classify::VisualClassifier;
use crate::detect::{DetectorSettings, VehicleDetector};
use crate::ingest::{self, mask_credentials, FrameSource, SourceSupervisor};
use crate::overlay::OverlayStream;
use crate::plate::PlateResolver;
use crate::worker::{CameraWorker, WorkerSettings, WorkerShared};
use crate::zone::Zone;
use crate::{Category, Clock, Entry};

/// Builds the per-source capabilities a worker needs.
pub trait PipelineFactory: Send + Sync {
    fn open_source(&self, source_id: &str) -> Result<Box<dyn FrameSource>>;

    fn build_detector(&self, source_id: &str) -> VehicleDetector;
}

/// Sources chosen by URL scheme, detector chosen by configuration.
pub struct DefaultPipeline {
    detector: DetectorSettings,
}

impl DefaultPipeline {
    pub fn new(detector: DetectorSettings) -> Self {
        Self { detector }
    }
}

impl PipelineFactory for DefaultPipeline {
    fn open_source(&self, source_id: &str) -> Result<Box<dyn FrameSource>> {
        ingest::open_source(source_id)
    }

    fn build_detector(&self, _source_id: &str) -> VehicleDetector {
        VehicleDetector::from_settings(&self.detector)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StartOutcome {
    pub source: String,
    pub zones: Vec<Zone>,
    /// The source was already running; its zones were left untouched.
    pub already_running: bool,
}

/// Entry counts over a trailing window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub window_sec: u64,
    pub total: usize,
    pub ev: usize,
    pub phev: usize,
    pub indeterminado: usize,
}

impl Summary {
    pub fn from_entries(window_sec: u64, entries: &[Entry]) -> Self {
        let count = |c: Category| entries.iter().filter(|e| e.category == c).count();
        let (ev, phev) = (count(Category::Ev), count(Category::Phev));
        Self {
            window_sec,
            total: entries.len(),
            ev,
            phev,
            indeterminado: entries.len() - ev - phev,
        }
    }
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: JoinHandle<()>,
}

pub struct VisionService {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    detached: Mutex<Vec<JoinHandle<()>>>,
    factory: Arc<dyn PipelineFactory>,
    resolver: Arc<PlateResolver>,
    classifier: Arc<dyn VisualClassifier>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    next_worker: AtomicU64,
}

impl VisionService {
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        resolver: Arc<PlateResolver>,
        classifier: Arc<dyn VisualClassifier>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            factory,
            resolver,
            classifier,
            clock,
            settings,
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, WorkerHandle>>> {
        self.workers
            .lock()
            .map_err(|_| anyhow!("worker registry lock poisoned"))
    }

    fn detach(&self, handle: WorkerHandle) {
        if let Ok(mut detached) = self.detached.lock() {
            detached.retain(|t| !t.is_finished());
            detached.push(handle.thread);
        }
    }

    /// Start a worker for `source_id`. Idempotent: a running source keeps
    /// its current zones.
    pub fn start(&self, source_id: &str, zones: Vec<Zone>) -> Result<StartOutcome> {
        let mut workers = self.registry()?;
        if let Some(existing) = workers.get(source_id) {
            if existing.shared.is_running() && !existing.shared.stop_requested() {
                return Ok(StartOutcome {
                    source: source_id.to_string(),
                    zones: existing.shared.zones()?,
                    already_running: true,
                });
            }
            if let Some(dead) = workers.remove(source_id) {
                warn!("service: replacing exited worker for {}", mask_credentials(source_id));
                self.detach(dead);
            }
        }

        let source = self
            .factory
            .open_source(source_id)
            .with_context(|| format!("cannot open source {}", mask_credentials(source_id)))?;
        let detector = self.factory.build_detector(source_id);
        let shared = Arc::new(WorkerShared::new(source_id, zones.clone()));
        let worker = CameraWorker::new(
            shared.clone(),
            SourceSupervisor::new(source, self.settings.reconnect.clone()),
            detector,
            self.resolver.clone(),
            self.classifier.clone(),
            self.clock.clone(),
            self.settings.clone(),
        );
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let thread = thread::Builder::new()
            .name(format!("camera-worker-{}", n))
            .spawn(move || worker.run())
            .context("spawn camera worker")?;

        info!(
            "service: started {} with {} zones",
            mask_credentials(source_id),
            zones.len()
        );
        workers.insert(source_id.to_string(), WorkerHandle { shared, thread });
        Ok(StartOutcome {
            source: source_id.to_string(),
            zones,
            already_running: false,
        })
    }

    /// Signal the worker and forget it. Unknown ids are a no-op (`false`).
    pub fn stop(&self, source_id: &str) -> Result<bool> {
        let Some(handle) = self.registry()?.remove(source_id) else {
            return Ok(false);
        };
        handle.shared.request_stop();
        info!("service: stopping {}", mask_credentials(source_id));
        self.detach(handle);
        Ok(true)
    }

    /// Replace a running worker's zones and reset their states.
    pub fn update_zones(&self, source_id: &str, zones: Vec<Zone>) -> Result<bool> {
        let workers = self.registry()?;
        let Some(handle) = workers.get(source_id) else {
            return Ok(false);
        };
        handle.shared.replace_zones(zones)?;
        Ok(true)
    }

    /// Entries with `ts >= since` from every worker, newest first.
    pub fn recent_entries(&self, since: f64) -> Result<Vec<Entry>> {
        let workers = self.registry()?;
        let mut out = Vec::new();
        for handle in workers.values() {
            out.extend(handle.shared.entries_since(since)?);
        }
        out.sort_by(|a, b| b.ts.total_cmp(&a.ts));
        Ok(out)
    }

    pub fn summary(&self, window_sec: u64) -> Result<Summary> {
        let since = self.clock.now() - window_sec as f64;
        let entries = self.recent_entries(since)?;
        Ok(Summary::from_entries(window_sec, &entries))
    }

    /// Overlay stream for a running source; `None` when it is not running.
    pub fn debug_stream(&self, source_id: &str, max_width: u32, quality: u8) -> Result<Option<OverlayStream>> {
        let workers = self.registry()?;
        Ok(workers.get(source_id).map(|handle| {
            OverlayStream::new(handle.shared.clone(), self.clock.clone(), max_width, quality)
        }))
    }

    pub fn running_sources(&self) -> Result<Vec<String>> {
        let mut sources: Vec<String> = self.registry()?.keys().cloned().collect();
        sources.sort();
        Ok(sources)
    }

    /// Stop every worker and wait for all worker threads to exit.
    pub fn shutdown(&self) -> Result<()> {
        let handles: Vec<WorkerHandle> = self.registry()?.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.shared.request_stop();
        }
        let mut threads: Vec<JoinHandle<()>> = handles.into_iter().map(|h| h.thread).collect();
        if let Ok(mut detached) = self.detached.lock() {
            threads.append(&mut detached);
        }
        let mut panicked = 0;
        for thread in threads {
            if thread.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} camera worker(s) panicked", panicked));
        }
        info!("service: all workers stopped");
        Ok(())
    }
}
