//! entry_inspect - run detection, plate resolution and classification on a
//! still image and print the entries it would produce.
//!
//! Uses the same environment/config file as `entryd` for the OCR service,
//! the registry and the model paths.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use entry_vision::classify::classifier_from_settings;
use entry_vision::config::EntrydConfig;
use entry_vision::detect::{DetectionBox, CLASS_CAR};
use entry_vision::worker::build_entry;
use entry_vision::{now_epoch_secs, Clock, Frame, SystemClock, VehicleDetector};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JPEG image to analyse.
    image: PathBuf,
    /// Source label written into the entries.
    #[arg(long, default_value = "still")]
    source: String,
    /// Skip detection and treat the whole image as one vehicle.
    #[arg(long)]
    whole_frame: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = EntrydConfig::load()?;

    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    let frame = Frame::decode(&bytes)?;

    let boxes = if args.whole_frame {
        Vec::new()
    } else {
        let mut detector = VehicleDetector::from_settings(&cfg.detector);
        if !detector.is_primary() {
            log::warn!("no detection model configured; using the whole image");
        }
        detector.detect(&frame)
    };
    let boxes = if boxes.is_empty() {
        vec![whole_frame_box(&frame)?]
    } else {
        boxes
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = cfg.plate_resolver(clock)?;
    let classifier = classifier_from_settings(&cfg.classifier);

    let now = now_epoch_secs();
    let entries: Vec<_> = boxes
        .iter()
        .filter_map(|b| build_entry(&frame, b, now, &args.source, &resolver, classifier.as_ref()))
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    if entries.is_empty() {
        eprintln!("no plate read in {} candidate box(es)", boxes.len());
    }
    Ok(())
}

fn whole_frame_box(frame: &Frame) -> Result<DetectionBox> {
    let w = i32::try_from(frame.width()).map_err(|_| anyhow!("image too wide"))?;
    let h = i32::try_from(frame.height()).map_err(|_| anyhow!("image too tall"))?;
    Ok(DetectionBox {
        x: 0,
        y: 0,
        w,
        h,
        confidence: 1.0,
        class_id: CLASS_CAR,
    })
}
