//! Reconciliation telemetry.

use std::collections::BTreeMap;
use std::time::SystemTime;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, GroupId};

/// Outcome of the last route operation on one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatus {
    pub group: GroupId,
    pub destination: IpNetwork,
    pub ok: bool,
    pub message: String,
}

/// A group moved its traffic from one connection to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChangeEvent {
    pub group: GroupId,
    pub previous: Option<ConnectionId>,
    pub current: Option<ConnectionId>,
    pub timestamp: SystemTime,
}

/// Events published by the router.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    RouteStatus(RouteStatus),
    PathChanged(PathChangeEvent),
}

/// Result of one `apply()` pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Iterations run (1 to the iteration limit).
    pub iterations: usize,
    /// Conflicts resolved across all iterations.
    pub conflicts_resolved: usize,
    /// Route statuses grouped by group id.
    pub statuses: BTreeMap<GroupId, Vec<RouteStatus>>,
    /// At most one change event per group.
    pub changes: Vec<PathChangeEvent>,
}

impl ApplyReport {
    /// Whether every route operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.statuses.values().flatten().all(|s| s.ok)
    }

    /// Statuses that report a failure.
    pub fn errors(&self) -> impl Iterator<Item = &RouteStatus> {
        self.statuses.values().flatten().filter(|s| !s.ok)
    }
}

/// Accumulates telemetry during one apply pass.
///
/// Later statuses for a destination replace earlier ones, and path changes
/// collapse to the first previous and the last current connection of each
/// group.
#[derive(Debug, Default)]
pub(crate) struct Telemetry {
    statuses: BTreeMap<GroupId, BTreeMap<IpNetwork, RouteStatus>>,
    changes: BTreeMap<GroupId, (Option<ConnectionId>, Option<ConnectionId>)>,
}

impl Telemetry {
    pub(crate) fn status(&mut self, group: &GroupId, destination: IpNetwork, ok: bool, message: impl Into<String>) {
        let status = RouteStatus {
            group: group.clone(),
            destination,
            ok,
            message: message.into(),
        };
        self.statuses
            .entry(group.clone())
            .or_default()
            .insert(destination, status);
    }

    pub(crate) fn changed(&mut self, group: &GroupId, previous: Option<ConnectionId>, current: Option<ConnectionId>) {
        self.changes
            .entry(group.clone())
            .and_modify(|(_, cur)| *cur = current.clone())
            .or_insert((previous, current));
    }

    pub(crate) fn finish(self, iterations: usize, conflicts_resolved: usize) -> ApplyReport {
        let timestamp = SystemTime::now();
        ApplyReport {
            iterations,
            conflicts_resolved,
            statuses: self
                .statuses
                .into_iter()
                .map(|(group, by_dest)| (group, by_dest.into_values().collect()))
                .collect(),
            changes: self
                .changes
                .into_iter()
                .filter(|(_, (previous, current))| previous != current)
                .map(|(group, (previous, current))| PathChangeEvent {
                    group,
                    previous,
                    current,
                    timestamp,
                })
                .collect(),
        }
    }
}
