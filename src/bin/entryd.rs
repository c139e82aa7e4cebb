//! entryd - vehicle entry daemon
//!
//! Loads the configuration, starts the configured camera workers and serves
//! the vision API until interrupted.

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use entry_vision::api::{ApiConfig, ApiServer, DEFAULT_ZONE};
use entry_vision::classify::classifier_from_settings;
use entry_vision::config::EntrydConfig;
use entry_vision::ingest::mask_credentials;
use entry_vision::service::DefaultPipeline;
use entry_vision::{Clock, SystemClock, VisionService, Zone};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// API listen address (overrides ENTRY_API_ADDR and the config file).
    #[arg(long)]
    api_addr: Option<String>,
    /// Extra source to start at boot with the default zone. Repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = EntrydConfig::load()?;
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = Arc::new(cfg.plate_resolver(clock.clone())?);
    let classifier = classifier_from_settings(&cfg.classifier);
    let service = Arc::new(VisionService::new(
        Arc::new(DefaultPipeline::new(cfg.detector.clone())),
        resolver,
        classifier,
        clock,
        cfg.worker_settings(),
    ));

    let default_zone = Zone::new(DEFAULT_ZONE[0], DEFAULT_ZONE[1], DEFAULT_ZONE[2], DEFAULT_ZONE[3])?;
    let boot_sources = cfg
        .sources
        .iter()
        .map(|s| (s.url.clone(), s.zones.clone()))
        .chain(args.sources.into_iter().map(|url| (url, vec![default_zone])));
    for (url, zones) in boot_sources {
        if let Err(err) = service.start(&url, zones) {
            log::warn!("could not start {}: {:#}", mask_credentials(&url), err);
        }
    }

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        service.clone(),
    )
    .spawn()?;
    log::info!("vision api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("entryd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server and workers...");
    api_handle.stop()?;
    service.shutdown()?;
    Ok(())
}
