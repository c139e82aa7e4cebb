use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionBox;
use crate::frame::Frame;

/// Scripted backend for tests and `stub://` deployments.
///
/// Returns queued box sets one per call; once the script runs out it keeps
/// returning the fallback set (empty unless built with [`StubBackend::fixed`]).
pub struct StubBackend {
    script: VecDeque<Vec<DetectionBox>>,
    fallback: Vec<DetectionBox>,
    failing: bool,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Vec::new(),
            failing: false,
        }
    }

    /// Same boxes on every frame.
    pub fn fixed(boxes: Vec<DetectionBox>) -> Self {
        Self {
            fallback: boxes,
            ..Self::new()
        }
    }

    /// One entry per frame, then nothing.
    pub fn scripted(frames: Vec<Vec<DetectionBox>>) -> Self {
        Self {
            script: frames.into(),
            ..Self::new()
        }
    }

    /// Backend whose every call fails, for exercising the fallback path.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>> {
        if self.failing {
            return Err(anyhow!("stub backend configured to fail"));
        }
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
