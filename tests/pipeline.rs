use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use entry_vision::classify::{Classification, VisualClassifier};
use entry_vision::detect::DetectorSettings;
use entry_vision::plate::{PlateCandidate, PlateReader, PlateResolver, RegistryClient};
use entry_vision::service::DefaultPipeline;
use entry_vision::{
    Category, Entry, Frame, ManualClock, Origin, VisionService, WorkerSettings, Zone,
};

const DRIVEWAY: &str = "stub://driveway?w=320&h=240&fps=0&period=20";

struct FixedReader;

impl PlateReader for FixedReader {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn read(&self, _crop: &Frame) -> Result<Vec<PlateCandidate>> {
        Ok(vec![
            PlateCandidate {
                text: "EXIT".to_string(),
                score: 0.99,
            },
            PlateCandidate {
                text: "xyz-789".to_string(),
                score: 0.91,
            },
        ])
    }
}

struct EmptyRegistry;

impl RegistryClient for EmptyRegistry {
    fn name(&self) -> &'static str {
        "empty"
    }

    fn lookup_by_plate(&self, _plate: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

struct KiaClassifier;

impl VisualClassifier for KiaClassifier {
    fn name(&self) -> &'static str {
        "kia"
    }

    fn classify(&self, _crop: &Frame) -> Classification {
        Classification {
            category: Category::Phev,
            score: 0.72,
            brand: Some("Kia".to_string()),
            model: Some("Niro".to_string()),
        }
    }
}

fn service() -> VisionService {
    let clock = Arc::new(ManualClock::new(500.0));
    let resolver = PlateResolver::new(
        Arc::new(FixedReader),
        Arc::new(EmptyRegistry),
        1800.0,
        clock.clone(),
    );
    VisionService::new(
        Arc::new(DefaultPipeline::new(DetectorSettings::default())),
        Arc::new(resolver),
        Arc::new(KiaClassifier),
        clock,
        WorkerSettings::default(),
    )
}

fn wait_for_entry(svc: &VisionService) -> Result<Entry> {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Some(entry) = svc.recent_entries(0.0)?.into_iter().next() {
            return Ok(entry);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("no entry committed"))
}

#[test]
fn motion_fallback_entry_attributed_by_classifier() -> Result<()> {
    let svc = service();
    let zone = Zone::new(0.1, 0.3, 0.9, 0.8)?;
    let outcome = svc.start(DRIVEWAY, vec![zone])?;
    assert!(!outcome.already_running);

    let entry = wait_for_entry(&svc)?;
    assert_eq!(entry.plate.as_deref(), Some("XYZ789"));
    assert_eq!(entry.origin, Origin::Ai);
    assert_eq!(entry.category, Category::Phev);
    assert_eq!(entry.brand.as_deref(), Some("Kia"));
    assert_eq!(entry.model.as_deref(), Some("Niro"));
    assert_eq!(entry.score, 0.91);
    assert_eq!(entry.ts, 500.0);
    assert_eq!(entry.source, DRIVEWAY);

    let summary = svc.summary(600)?;
    assert_eq!(summary.phev, summary.total);
    assert!(summary.total >= 1);

    svc.stop(DRIVEWAY)?;
    assert!(svc.recent_entries(0.0)?.is_empty());
    svc.shutdown()
}

#[test]
fn zone_outside_the_scene_never_commits() -> Result<()> {
    let svc = service();
    // The synthetic vehicle stays in the middle third of the frame.
    svc.start(DRIVEWAY, vec![Zone::new(0.0, 0.0, 0.2, 0.2)?])?;
    std::thread::sleep(Duration::from_millis(500));
    assert!(svc.recent_entries(0.0)?.is_empty());

    assert!(svc.update_zones(DRIVEWAY, vec![Zone::new(0.1, 0.3, 0.9, 0.8)?])?);
    let entry = wait_for_entry(&svc)?;
    assert_eq!(entry.category, Category::Phev);
    svc.shutdown()
}
