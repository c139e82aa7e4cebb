//! Frame ingestion sources.
//!
//! This module provides the camera sources a worker reads from:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - HTTP MJPEG streams and JPEG snapshot endpoints
//! - Stub source (`stub://`, synthetic scenes for tests and demos)
//!
//! Sources hand out decoded `Frame`s one at a time. Reconnection is not the
//! source's job: the `SourceSupervisor` counts consecutive read failures and
//! closes/reopens the source once the policy threshold is crossed.

pub mod mjpeg;
pub mod rtsp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use url::Url;

use crate::frame::Frame;

pub use mjpeg::MjpegSource;
pub use rtsp::{mask_credentials, rtsp_url_from_env, rtsp_url_from_parts, RtspConfig, RtspSource};

/// A camera feed.
pub trait FrameSource: Send {
    /// Transport description safe for logs (credentials masked).
    fn describe(&self) -> String;

    /// Open the transport. Idempotent; `false` when the camera is unreachable.
    fn open(&mut self) -> bool;

    /// Next decoded frame. An error is one failed read, not a fatal condition.
    fn read_frame(&mut self) -> Result<Frame>;

    fn close(&mut self);
}

/// Pick a source implementation from the URL scheme.
pub fn open_source(url: &str) -> Result<Box<dyn FrameSource>> {
    let parsed = Url::parse(url).with_context(|| format!("parse source url {}", mask_credentials(url)))?;
    match parsed.scheme() {
        "stub" | "rtsp" | "rtsps" => Ok(Box::new(RtspSource::new(RtspConfig::from_url(url)?)?)),
        "http" | "https" => Ok(Box::new(MjpegSource::new(url))),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected rtsp, http(s) or stub",
            other
        )),
    }
}

/// Reconnect behaviour for a supervised source.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Reopen once failures exceed this count.
    pub max_consecutive_failures: u32,
    /// Sleep after an ordinary failed read.
    pub failure_delay: Duration,
    /// Sleep between close and reopen.
    pub reconnect_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 50,
            failure_delay: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

/// Counters exposed for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub frames: u64,
    pub failed_reads: u64,
    pub reopens: u64,
    pub consecutive_failures: u32,
}

/// Wraps a source with the failure counting and reopen policy.
pub struct SourceSupervisor {
    source: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    stats: SupervisorStats,
}

impl SourceSupervisor {
    pub fn new(source: Box<dyn FrameSource>, policy: ReconnectPolicy) -> Self {
        Self {
            source,
            policy,
            stats: SupervisorStats::default(),
        }
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// Initial open. Failure is logged; reads will keep retrying.
    pub fn start(&mut self) -> bool {
        let opened = self.source.open();
        if opened {
            info!("source: opened {}", self.source.describe());
        } else {
            warn!("source: could not open {}", self.source.describe());
        }
        opened
    }

    /// One read attempt. `None` means no frame this iteration; the policy
    /// delay (or reopen) has already been applied.
    pub fn next_frame(&mut self, stop: &AtomicBool) -> Option<Frame> {
        match self.source.read_frame() {
            Ok(frame) => {
                self.stats.frames += 1;
                self.stats.consecutive_failures = 0;
                Some(frame)
            }
            Err(err) => {
                self.stats.failed_reads += 1;
                self.stats.consecutive_failures += 1;
                debug!(
                    "source: read failed on {} ({} in a row): {:#}",
                    self.source.describe(),
                    self.stats.consecutive_failures,
                    err
                );
                if self.stats.consecutive_failures > self.policy.max_consecutive_failures {
                    self.reopen(stop);
                } else {
                    sleep_unless_stopped(self.policy.failure_delay, stop);
                }
                None
            }
        }
    }

    fn reopen(&mut self, stop: &AtomicBool) {
        warn!(
            "source: {} consecutive failures on {}, reconnecting",
            self.stats.consecutive_failures,
            self.source.describe()
        );
        self.source.close();
        sleep_unless_stopped(self.policy.reconnect_backoff, stop);
        self.stats.reopens += 1;
        self.stats.consecutive_failures = 0;
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if self.source.open() {
            info!("source: reopened {}", self.source.describe());
        } else {
            warn!("source: reopen failed for {}", self.source.describe());
        }
    }

    pub fn release(&mut self) {
        self.source.close();
    }
}

/// Sleep in short slices so a stop request is observed promptly.
pub(crate) fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
