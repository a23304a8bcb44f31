//! Path quality snapshot.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SampleWindow;

/// Point-in-time view of a path's moving averages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathQuality {
    /// Mean latency over responsive rounds.
    pub latency: Duration,
    /// Loss ratio over the whole window (0.0 - 1.0).
    pub loss: f64,
    /// Whether every slot of the window holds a latency sample.
    pub complete: bool,
    /// Rounds recorded so far.
    pub rounds: u64,
}

impl PathQuality {
    /// Capture the current state of a window.
    pub fn from_window(window: &SampleWindow) -> Self {
        Self {
            latency: window.latency(),
            loss: window.loss(),
            complete: !window.incomplete(),
            rounds: window.recorded(),
        }
    }

    /// Check if metrics indicate a problem.
    pub fn has_issues(&self) -> bool {
        self.loss > 0.1 || self.latency > Duration::from_secs(1)
    }

    /// Get a human-readable status.
    pub fn status(&self) -> &'static str {
        if self.rounds == 0 {
            "unknown"
        } else if self.loss >= 1.0 {
            "down"
        } else if self.has_issues() {
            "degraded"
        } else if !self.complete {
            "warming"
        } else {
            "good"
        }
    }

    /// Get a brief summary.
    pub fn summary(&self) -> String {
        format!(
            "latency={:.1}ms loss={:.1}% status={}",
            self.latency.as_secs_f64() * 1000.0,
            self.loss * 100.0,
            self.status()
        )
    }
}

impl Default for PathQuality {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            loss: 0.0,
            complete: false,
            rounds: 0,
        }
    }
}
