//! Best-path selection with hysteresis.
//!
//! Two strategies share one comparator and differ only in which path the
//! momentary best is measured against:
//! - Lowest latency: the previously selected path
//! - Prefer direct: the public path

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Path;
use crate::metrics::DEFAULT_WINDOW_SIZE;
use crate::types::{ChangeReason, ConnectionId, SelectedRoute};

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Follow the lowest-loss, then lowest-latency path.
    #[default]
    LowestLatency,
    /// Stay on the public path unless an overlay is clearly better.
    PreferDirect,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowestLatency => write!(f, "lowest_latency"),
            Self::PreferDirect => write!(f, "prefer_direct"),
        }
    }
}

/// Selector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Selection strategy.
    #[serde(default)]
    pub strategy: SelectionStrategy,

    /// Number of probe rounds kept per path.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Minimum `old / new` latency ratio for a latency-triggered switch.
    #[serde(default = "default_reroute_ratio")]
    pub reroute_ratio: f64,

    /// Minimum absolute latency gain for a latency-triggered switch.
    #[serde(default = "default_reroute_diff", with = "humantime_serde")]
    pub reroute_diff: Duration,

    /// Loss percentage at which the chosen path is torn down (0 = off).
    #[serde(default)]
    pub route_delete_loss_threshold: u8,
}

fn default_window_size() -> usize { DEFAULT_WINDOW_SIZE }
fn default_reroute_ratio() -> f64 { 1.2 }
fn default_reroute_diff() -> Duration { Duration::from_millis(10) }

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            window_size: default_window_size(),
            reroute_ratio: default_reroute_ratio(),
            reroute_diff: default_reroute_diff(),
            route_delete_loss_threshold: 0,
        }
    }
}

/// Ordering key of the momentary-best rule: loss first, then latency, with
/// an unmeasured latency ranking last.
fn rank(path: &Path) -> (f64, Duration) {
    let latency = path.latency();
    let latency = if latency.is_zero() { Duration::MAX } else { latency };
    (path.loss(), latency)
}

fn better(a: &Path, b: &Path) -> bool {
    let (a_loss, a_lat) = rank(a);
    let (b_loss, b_lat) = rank(b);
    match a_loss.partial_cmp(&b_loss).unwrap_or(Ordering::Equal) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a_lat < b_lat,
    }
}

/// Lowest (loss, latency) among valid paths; the first in key order wins
/// ties.
pub fn momentary_best<'a, I>(paths: I) -> Option<&'a Path>
where
    I: IntoIterator<Item = &'a Path>,
{
    paths
        .into_iter()
        .filter(|p| p.valid())
        .fold(None, |best: Option<&Path>, p| match best {
            Some(b) if !better(p, b) => Some(b),
            _ => Some(p),
        })
}

/// Per-group path selector. Keeps the last selection between calls.
#[derive(Debug, Clone)]
pub struct PathSelector {
    config: SelectorConfig,
    last_best: Option<ConnectionId>,
}

impl PathSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            last_best: None,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Connection chosen by the previous call, if any.
    pub fn last_best(&self) -> Option<&ConnectionId> {
        self.last_best.as_ref()
    }

    /// Forget the previous selection.
    pub fn reset(&mut self) {
        self.last_best = None;
    }

    /// Decide whether `candidate` should replace `reference`.
    ///
    /// Loss dominates: a strictly lower loss always wins. Otherwise the
    /// candidate needs a complete window and must clear both the ratio and
    /// the absolute difference thresholds.
    pub fn compare(&self, reference: &Path, candidate: &Path) -> Option<ChangeReason> {
        let (old_loss, new_loss) = (reference.loss(), candidate.loss());
        if new_loss < old_loss {
            return Some(ChangeReason::LossImproved {
                old: old_loss,
                new: new_loss,
            });
        }
        if new_loss > old_loss || candidate.incomplete() {
            return None;
        }

        let (old, new) = (reference.latency(), candidate.latency());
        if old.is_zero() || new.is_zero() || new >= old {
            return None;
        }

        let ratio = old.as_secs_f64() / new.as_secs_f64();
        if ratio >= self.config.reroute_ratio && old - new >= self.config.reroute_diff {
            Some(ChangeReason::LatencyImproved { old, new })
        } else {
            None
        }
    }

    /// Select the best path of a group.
    pub fn best_path(&mut self, paths: &BTreeMap<ConnectionId, Path>) -> SelectedRoute {
        // A previous choice that is gone or no longer eligible is forgotten
        // rather than compared against.
        let last = self
            .last_best
            .as_ref()
            .and_then(|id| paths.get(id))
            .filter(|p| p.valid());
        if last.is_none() {
            self.last_best = None;
        }

        let Some(best) = momentary_best(paths.values()) else {
            self.reset();
            return SelectedRoute::deleted(None);
        };

        let reference = match self.config.strategy {
            SelectionStrategy::LowestLatency => last,
            SelectionStrategy::PreferDirect => paths
                .values()
                .find(|p| p.is_public() && p.valid())
                .or(last),
        };

        let (chosen, reason) = match reference {
            None => (best, None),
            Some(r) if r.connection() == best.connection() => (r, None),
            Some(r) => match self.compare(r, best) {
                Some(reason) => (best, Some(reason)),
                None => (r, None),
            },
        };

        let reason = match last {
            None => ChangeReason::NewRoute,
            Some(l) if l.connection() == chosen.connection() => ChangeReason::NoChange,
            Some(l) => match (reference, reason) {
                (Some(r), Some(reason)) if r.connection() == l.connection() => reason,
                _ => describe(l, chosen),
            },
        };

        let threshold = self.config.route_delete_loss_threshold;
        let loss = chosen.loss();
        if threshold > 0 && chosen.window().loss_reaches(threshold) {
            tracing::debug!(
                connection = %chosen.connection(),
                loss = loss,
                threshold = threshold,
                "Selected path crosses loss threshold"
            );
            self.reset();
            return SelectedRoute::deleted(Some(loss));
        }

        self.last_best = Some(chosen.connection().clone());
        SelectedRoute {
            address: Some(chosen.address()),
            connection: Some(chosen.connection().clone()),
            reason,
        }
    }
}

impl Default for PathSelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

/// Reason for a switch the comparator did not itself report.
fn describe(previous: &Path, chosen: &Path) -> ChangeReason {
    let (old_loss, new_loss) = (previous.loss(), chosen.loss());
    let (old, new) = (previous.latency(), chosen.latency());
    if new_loss < old_loss {
        ChangeReason::LossImproved {
            old: old_loss,
            new: new_loss,
        }
    } else if !old.is_zero() && !new.is_zero() && new < old {
        ChangeReason::LatencyImproved { old, new }
    } else {
        ChangeReason::NewRoute
    }
}
