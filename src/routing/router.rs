//! Route reconciler.
//!
//! Mutations only flag intent; [`Router::apply`] turns intent into route
//! table operations in a bounded number of passes, disabling the losing
//! side of every cross-group claim on the same prefix.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::adapter::{RouteAdapter, SystemRouteAdapter};
use super::status::{ApplyReport, RouterEvent, Telemetry};
use crate::error::{Result, RouteError};
use crate::multipath::{ActiveRoute, GroupStatus, PathConfig, RouteGroup, SelectorConfig, ServiceAction};
use crate::probe::ProbeStats;
use crate::types::{ConnectionId, GroupId, PathFlags};

/// Upper bound on apply/resolve passes per `apply()` call.
pub const MAX_APPLY_ITERATIONS: usize = 3;

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Interval between reconciliation passes.
    #[serde(default = "default_apply_interval", with = "humantime_serde")]
    pub apply_interval: Duration,

    /// Routing table to install routes into (Linux, main when unset).
    #[serde(default)]
    pub table: Option<u32>,
}

fn default_apply_interval() -> Duration { Duration::from_secs(5) }

impl RouterConfig {
    /// OS route adapter targeting the configured table.
    pub fn system_adapter(&self) -> SystemRouteAdapter {
        match self.table {
            Some(table) => SystemRouteAdapter::new().with_table(table),
            None => SystemRouteAdapter::new(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            apply_interval: default_apply_interval(),
            table: None,
        }
    }
}

struct RouterState {
    groups: BTreeMap<GroupId, RouteGroup>,
    /// Monotonic claim sequence; lower claims win conflicts.
    next_claim: u64,
}

impl RouterState {
    fn claim(&mut self) -> u64 {
        self.next_claim += 1;
        self.next_claim
    }

    /// Interfaces this agent put routes on, or is about to.
    fn managed_interfaces(&self) -> HashSet<String> {
        let mut managed = HashSet::new();
        for group in self.groups.values() {
            for path in group.paths().values() {
                managed.insert(path.interface().to_string());
                if let Some(iface) = path.installed_interface() {
                    managed.insert(iface.to_string());
                }
            }
            for service in group.services().values() {
                if let Some(active) = service.active() {
                    managed.insert(active.interface.clone());
                }
            }
        }
        managed
    }

    /// Prefixes currently installed, with the group owning them.
    fn installed_prefixes(&self) -> HashMap<IpNetwork, GroupId> {
        let mut installed = HashMap::new();
        for (id, group) in &self.groups {
            for path in group.paths().values().filter(|p| p.is_installed()) {
                installed.insert(path.destination(), id.clone());
            }
            for service in group.services().values().filter(|s| s.active().is_some()) {
                installed.insert(service.prefix(), id.clone());
            }
        }
        installed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClaimKind {
    Path(ConnectionId),
    Service,
}

#[derive(Debug, Clone)]
struct Claim {
    group: GroupId,
    kind: ClaimKind,
    installed: bool,
    disabled: bool,
    seq: u64,
}

/// Owner of all route groups.
pub struct Router {
    state: Mutex<RouterState>,
    adapter: Arc<dyn RouteAdapter>,
    selection: SelectorConfig,
    event_tx: broadcast::Sender<RouterEvent>,
}

impl Router {
    /// Create a router that installs routes through `adapter`.
    pub fn new(selection: SelectorConfig, adapter: Arc<dyn RouteAdapter>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(RouterState {
                groups: BTreeMap::new(),
                next_claim: 0,
            }),
            adapter,
            selection,
            event_tx,
        }
    }

    /// Subscribe to route status and path change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.event_tx.subscribe()
    }

    /// Register (or refresh) a path of `group` to a peer.
    pub fn add_peer(&self, group: impl Into<GroupId>, config: PathConfig) -> Result<()> {
        let group = group.into();
        if config.address.is_unspecified() || config.interface.is_empty() {
            tracing::warn!(group = %group, address = %config.address, "Ignoring peer with invalid address or interface");
            return Ok(());
        }

        let mut state = self.state.lock();
        let claim = state.claim();
        let selection = self.selection.clone();
        let entry = state
            .groups
            .entry(group.clone())
            .or_insert_with(|| RouteGroup::new(group.clone(), selection));

        let connection = config.connection.clone();
        if entry.add_path(config, claim) {
            tracing::debug!(group = %group, connection = %connection, "Added peer path");
        }
        Ok(())
    }

    /// Mark a path for removal. Unknown groups or paths are a no-op.
    pub fn del_peer(&self, group: &GroupId, connection: &ConnectionId) -> Result<()> {
        let mut state = self.state.lock();
        let found = state
            .groups
            .get_mut(group)
            .is_some_and(|g| g.del_path(connection));
        if !found {
            tracing::warn!(group = %group, connection = %connection, "Delete of unknown peer path");
        }
        Ok(())
    }

    /// Route `prefix` through `connection` of `group`.
    pub fn add_service(&self, group: impl Into<GroupId>, prefix: IpNetwork, connection: impl Into<ConnectionId>) -> Result<()> {
        let group = group.into();
        let mut state = self.state.lock();
        let claim = state.claim();
        let selection = self.selection.clone();
        state
            .groups
            .entry(group.clone())
            .or_insert_with(|| RouteGroup::new(group, selection))
            .add_service(prefix, connection.into(), claim);
        Ok(())
    }

    /// Drop `connection` as a candidate for `prefix`. Unknown entries are a
    /// no-op.
    pub fn del_service(&self, group: &GroupId, prefix: IpNetwork, connection: &ConnectionId) -> Result<()> {
        let mut state = self.state.lock();
        let found = state
            .groups
            .get_mut(group)
            .is_some_and(|g| g.del_service(prefix, connection));
        if !found {
            tracing::warn!(group = %group, prefix = %prefix, connection = %connection, "Delete of unknown service route");
        }
        Ok(())
    }

    /// Mark every path and service for deletion.
    ///
    /// Callers must not run this concurrently with [`apply`](Self::apply)
    /// when re-adding state afterwards.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        for group in state.groups.values_mut() {
            group.flush();
        }
        tracing::info!(groups = state.groups.len(), "Flushed all routes");
    }

    /// Addresses to probe: every path not being deleted or disabled.
    pub fn destinations(&self) -> Vec<IpAddr> {
        let state = self.state.lock();
        let mut addrs: Vec<IpAddr> = state
            .groups
            .values()
            .flat_map(|g| g.paths().values())
            .filter(|p| !p.flags().is_pending_del() && !p.flags().is_disabled())
            .map(|p| p.address())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Feed one finished probe round into the path windows.
    ///
    /// Every path whose address took part in the round gets exactly one
    /// sample. Addresses absent from `results` are left untouched.
    pub fn record_round(&self, results: &HashMap<IpAddr, ProbeStats>) {
        let mut state = self.state.lock();
        for group in state.groups.values_mut() {
            for path in group.paths_mut().values_mut() {
                if path.flags().is_pending_del() {
                    continue;
                }
                let Some(stats) = results.get(&path.address()) else {
                    continue;
                };
                match stats.rtt() {
                    Some(rtt) => path.record(rtt.max(Duration::from_micros(1)), false),
                    None => path.record(Duration::ZERO, true),
                }
            }
        }
    }

    /// Status of every group, taken under the router lock.
    pub fn snapshot(&self) -> Vec<GroupStatus> {
        let state = self.state.lock();
        state.groups.values().map(RouteGroup::status).collect()
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Reconcile the route table with the recorded intent.
    ///
    /// Holds the router lock for the whole pass, route operations included.
    pub fn apply(&self) -> ApplyReport {
        let mut state = self.state.lock();
        let mut telemetry = Telemetry::default();
        let mut iterations = 0;
        let mut conflicts = 0;

        while iterations < MAX_APPLY_ITERATIONS {
            iterations += 1;
            self.apply_pending(&mut state, &mut telemetry);

            let resolved = self.resolve_conflicts(&mut state, &mut telemetry);
            conflicts += resolved;
            if resolved == 0 {
                break;
            }
            tracing::debug!(iteration = iterations, resolved = resolved, "Resolved route conflicts");
        }

        let before = state.groups.len();
        state.groups.retain(|_, g| !g.is_empty());
        if state.groups.len() != before {
            tracing::debug!(removed = before - state.groups.len(), "Dropped empty groups");
        }
        drop(state);

        let report = telemetry.finish(iterations, conflicts);
        for statuses in report.statuses.values() {
            for status in statuses {
                let _ = self.event_tx.send(RouterEvent::RouteStatus(status.clone()));
            }
        }
        for change in &report.changes {
            tracing::info!(
                group = %change.group,
                previous = ?change.previous,
                current = ?change.current,
                "Group path changed"
            );
            let _ = self.event_tx.send(RouterEvent::PathChanged(change.clone()));
        }
        report
    }

    /// Install `destination` unless a foreign interface owns it.
    fn install(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork, managed: &HashSet<String>) -> Result<&'static str> {
        match self.adapter.route_conflict(destination)? {
            None => {
                self.adapter.route_add(interface, gateway, destination)?;
                Ok("route added")
            }
            Some(owner) if managed.contains(&owner) => {
                self.adapter.route_replace(interface, gateway, destination)?;
                Ok("route replaced")
            }
            Some(owner) => Err(RouteError::ExternalConflict {
                destination: destination.to_string(),
                interface: owner,
            }
            .into()),
        }
    }

    fn apply_pending(&self, state: &mut RouterState, telemetry: &mut Telemetry) {
        let managed = state.managed_interfaces();
        let mut installed = state.installed_prefixes();

        for (id, group) in state.groups.iter_mut() {
            self.apply_paths(id, group, &managed, &mut installed, telemetry);
            group.reselect();
            self.apply_services(id, group, &managed, &mut installed, telemetry);
        }
    }

    fn apply_paths(
        &self,
        id: &GroupId,
        group: &mut RouteGroup,
        managed: &HashSet<String>,
        installed: &mut HashMap<IpNetwork, GroupId>,
        telemetry: &mut Telemetry,
    ) {
        let mut removed = Vec::new();

        for (connection, path) in group.paths_mut().iter_mut() {
            let destination = path.destination();

            if path.flags().is_pending_del() {
                if let Some(iface) = path.installed_interface() {
                    if let Err(e) = self.adapter.route_del(iface, &destination) {
                        tracing::warn!(group = %id, destination = %destination, error = %e, "Failed to remove peer route");
                        telemetry.status(id, destination, false, e.to_string());
                        continue;
                    }
                    if installed.get(&destination) == Some(id) {
                        installed.remove(&destination);
                    }
                    telemetry.status(id, destination, true, "route removed");
                }
                removed.push(connection.clone());
                continue;
            }

            let flags = path.flags();
            if flags.is_disabled() || (!flags.is_pending_add() && path.is_installed()) {
                continue;
            }

            if let Some(owner) = installed.get(&destination).filter(|owner| *owner != id) {
                tracing::debug!(group = %id, destination = %destination, owner = %owner, "Peer route blocked by another group");
                continue;
            }

            match self.install(path.interface(), path.gateway(), &destination, managed) {
                Ok(message) => {
                    tracing::info!(group = %id, destination = %destination, interface = %path.interface(), "{}", message);
                    path.set_installed(Some(path.interface().to_string()));
                    path.flags_mut().clear(PathFlags::PENDING_ADD);
                    installed.insert(destination, id.clone());
                    telemetry.status(id, destination, true, message);
                }
                Err(e) if e.is_external_conflict() => {
                    tracing::warn!(group = %id, destination = %destination, error = %e, "Skipping route owned by foreign interface");
                    telemetry.status(id, destination, false, e.to_string());
                }
                Err(e) => {
                    tracing::warn!(group = %id, destination = %destination, error = %e, "Failed to install peer route");
                    telemetry.status(id, destination, false, e.to_string());
                }
            }
        }

        for connection in removed {
            group.paths_mut().remove(&connection);
            tracing::debug!(group = %id, connection = %connection, "Removed peer path");
        }
    }

    fn apply_services(
        &self,
        id: &GroupId,
        group: &mut RouteGroup,
        managed: &HashSet<String>,
        installed: &mut HashMap<IpNetwork, GroupId>,
        telemetry: &mut Telemetry,
    ) {
        let prefixes: Vec<IpNetwork> = group.services().keys().copied().collect();

        for prefix in prefixes {
            let Some(service) = group.services().get(&prefix) else {
                continue;
            };
            let desired = group.desired_for(service);
            let action = service.plan(desired.as_ref());
            let previous = service.active().cloned();

            let target = match &action {
                ServiceAction::SetRoute(to) | ServiceAction::MergeRoutes { to, .. } => {
                    group.path(to).map(|p| ActiveRoute {
                        connection: to.clone(),
                        interface: p.interface().to_string(),
                        gateway: Some(p.next_hop()),
                    })
                }
                _ => None,
            };

            let result = match (&action, &target, &previous) {
                (ServiceAction::Keep, _, _) => Ok(None),
                (ServiceAction::SetRoute(_), Some(target), _) => {
                    match installed.get(&prefix).filter(|owner| *owner != id) {
                        Some(owner) => {
                            tracing::debug!(group = %id, prefix = %prefix, owner = %owner, "Service route blocked by another group");
                            continue;
                        }
                        None => self
                            .install(&target.interface, target.gateway, &prefix, managed)
                            .map(Some),
                    }
                }
                (ServiceAction::MergeRoutes { .. }, Some(target), _) => self
                    .adapter
                    .route_replace(&target.interface, target.gateway, &prefix)
                    .map(|()| Some("route replaced")),
                (ServiceAction::ClearRoute, _, Some(active)) => self
                    .adapter
                    .route_del(&active.interface, &prefix)
                    .map(|()| Some("route removed")),
                _ => Ok(None),
            };

            let Some(service) = group.services_mut().get_mut(&prefix) else {
                continue;
            };
            match result {
                Ok(None) => {}
                Ok(Some(message)) => {
                    let current = match action {
                        ServiceAction::ClearRoute => None,
                        _ => target,
                    };
                    match &current {
                        Some(_) => {
                            installed.insert(prefix, id.clone());
                        }
                        None => {
                            if installed.get(&prefix) == Some(id) {
                                installed.remove(&prefix);
                            }
                        }
                    }
                    tracing::info!(
                        group = %id,
                        prefix = %prefix,
                        previous = ?previous.as_ref().map(|a| &a.connection),
                        current = ?current.as_ref().map(|a| &a.connection),
                        "{}",
                        message
                    );
                    telemetry.status(id, prefix, true, message);
                    telemetry.changed(
                        id,
                        previous.map(|a| a.connection),
                        current.as_ref().map(|a| a.connection.clone()),
                    );
                    service.set_active(current);
                }
                Err(e) => {
                    if e.is_external_conflict() {
                        tracing::warn!(group = %id, prefix = %prefix, error = %e, "Skipping route owned by foreign interface");
                    } else {
                        tracing::warn!(group = %id, prefix = %prefix, error = %e, "Failed to reconcile service route");
                    }
                    telemetry.status(id, prefix, false, e.to_string());
                    continue;
                }
            }

            service.commit();
            if service.is_cleared() && service.active().is_none() {
                group.services_mut().remove(&prefix);
                tracing::debug!(group = %id, prefix = %prefix, "Removed service route");
            }
        }
    }

    /// Disable the losing side of every prefix claimed by several groups
    /// and re-enable entries whose conflict went away. Returns the number
    /// of entries changed.
    fn resolve_conflicts(&self, state: &mut RouterState, telemetry: &mut Telemetry) -> usize {
        let mut claims: BTreeMap<IpNetwork, Vec<Claim>> = BTreeMap::new();
        for (id, group) in &state.groups {
            for path in group.paths().values().filter(|p| !p.flags().is_pending_del()) {
                claims.entry(path.destination()).or_default().push(Claim {
                    group: id.clone(),
                    kind: ClaimKind::Path(path.connection().clone()),
                    installed: path.is_installed(),
                    disabled: path.flags().is_disabled(),
                    seq: path.claim(),
                });
            }
            for service in group.services().values().filter(|s| !s.is_cleared()) {
                claims.entry(service.prefix()).or_default().push(Claim {
                    group: id.clone(),
                    kind: ClaimKind::Service,
                    installed: service.active().is_some(),
                    disabled: service.flags().is_disabled(),
                    seq: service.claim(),
                });
            }
        }

        let mut disable = Vec::new();
        let mut enable = Vec::new();

        for (prefix, claims) in &claims {
            let active: Vec<&Claim> = claims.iter().filter(|c| !c.disabled).collect();
            let groups: HashSet<&GroupId> = active.iter().map(|c| &c.group).collect();

            if groups.len() > 1 {
                let Some(winner) = active.iter().min_by_key(|c| (!c.installed, c.seq)) else {
                    continue;
                };
                for loser in active.iter().filter(|c| c.group != winner.group) {
                    disable.push((*prefix, (*loser).clone(), winner.group.clone()));
                }
                continue;
            }

            // No conflict left: wake up disabled entries of the surviving
            // group, or of the oldest disabled claimant.
            let owner = match groups.iter().next() {
                Some(g) => Some((*g).clone()),
                None => claims
                    .iter()
                    .filter(|c| c.disabled)
                    .min_by_key(|c| c.seq)
                    .map(|c| c.group.clone()),
            };
            if let Some(owner) = owner {
                for claim in claims.iter().filter(|c| c.disabled && c.group == owner) {
                    enable.push((*prefix, claim.clone()));
                }
            }
        }

        let resolved = disable.len() + enable.len();

        for (prefix, claim, winner) in disable {
            let Some(group) = state.groups.get_mut(&claim.group) else {
                continue;
            };
            tracing::info!(group = %claim.group, prefix = %prefix, winner = %winner, "Disabling conflicting route");
            telemetry.status(&claim.group, prefix, false, format!("conflict: claimed by group {winner}"));

            match claim.kind {
                ClaimKind::Path(connection) => {
                    let Some(path) = group.paths_mut().get_mut(&connection) else {
                        continue;
                    };
                    path.flags_mut().set(PathFlags::DISABLED);
                    if let Some(iface) = path.installed_interface() {
                        match self.adapter.route_del(iface, &prefix) {
                            Ok(()) => path.set_installed(None),
                            Err(e) => tracing::warn!(group = %claim.group, prefix = %prefix, error = %e, "Failed to remove conflicting route"),
                        }
                    }
                }
                ClaimKind::Service => {
                    let Some(service) = group.services_mut().get_mut(&prefix) else {
                        continue;
                    };
                    service.flags_mut().set(PathFlags::DISABLED);
                    if let Some(active) = service.active().cloned() {
                        match self.adapter.route_del(&active.interface, &prefix) {
                            Ok(()) => {
                                service.set_active(None);
                                telemetry.changed(&claim.group, Some(active.connection), None);
                            }
                            Err(e) => tracing::warn!(group = %claim.group, prefix = %prefix, error = %e, "Failed to remove conflicting route"),
                        }
                    }
                }
            }
        }

        for (prefix, claim) in enable {
            let Some(group) = state.groups.get_mut(&claim.group) else {
                continue;
            };
            tracing::info!(group = %claim.group, prefix = %prefix, "Re-enabling route after conflict cleared");

            match claim.kind {
                ClaimKind::Path(connection) => {
                    if let Some(path) = group.paths_mut().get_mut(&connection) {
                        path.flags_mut().clear(PathFlags::DISABLED);
                        path.flags_mut().set(PathFlags::PENDING_ADD);
                    }
                }
                ClaimKind::Service => {
                    if let Some(service) = group.services_mut().get_mut(&prefix) {
                        service.flags_mut().clear(PathFlags::DISABLED);
                    }
                }
            }
        }

        resolved
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("groups", &self.group_count())
            .field("selection", &self.selection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct NullAdapter {
        table: Mutex<HashMap<IpNetwork, String>>,
    }

    impl RouteAdapter for NullAdapter {
        fn route_add(&self, interface: &str, _gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
            self.table.lock().insert(*destination, interface.to_string());
            Ok(())
        }

        fn route_del(&self, _interface: &str, destination: &IpNetwork) -> Result<()> {
            self.table.lock().remove(destination);
            Ok(())
        }

        fn route_replace(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
            self.route_add(interface, gateway, destination)
        }

        fn route_conflict(&self, destination: &IpNetwork) -> Result<Option<String>> {
            Ok(self.table.lock().get(destination).cloned())
        }
    }

    fn router() -> (Router, Arc<NullAdapter>) {
        let adapter = Arc::new(NullAdapter::default());
        (Router::new(SelectorConfig::default(), adapter.clone()), adapter)
    }

    #[test]
    fn test_mutations_only_flag_intent() {
        let (router, adapter) = router();
        router
            .add_peer("g1", PathConfig::new("a", "wg-a", "10.0.0.1".parse().unwrap()))
            .unwrap();
        assert!(adapter.table.lock().is_empty());

        let report = router.apply();
        assert_eq!(report.iterations, 1);
        assert_eq!(adapter.table.lock().len(), 1);
    }

    #[test]
    fn test_unknown_deletes_are_noops() {
        let (router, _) = router();
        let result: std::result::Result<(), Error> =
            router.del_peer(&GroupId::new("nope"), &ConnectionId::new("a"));
        assert!(result.is_ok());
        assert!(router
            .del_service(&GroupId::new("nope"), "10.9.0.0/16".parse().unwrap(), &ConnectionId::new("a"))
            .is_ok());
        assert_eq!(router.group_count(), 0);
    }

    #[test]
    fn test_unspecified_address_rejected() {
        let (router, _) = router();
        router
            .add_peer("g1", PathConfig::new("a", "wg-a", "0.0.0.0".parse().unwrap()))
            .unwrap();
        assert_eq!(router.group_count(), 0);
    }

    #[test]
    fn test_delete_removes_group() {
        let (router, adapter) = router();
        router
            .add_peer("g1", PathConfig::new("a", "wg-a", "10.0.0.1".parse().unwrap()))
            .unwrap();
        router.apply();

        router.del_peer(&GroupId::new("g1"), &ConnectionId::new("a")).unwrap();
        router.apply();
        assert!(adapter.table.lock().is_empty());
        assert_eq!(router.group_count(), 0);
    }

    #[test]
    fn test_system_adapter_table() {
        let config = RouterConfig {
            table: Some(7),
            ..Default::default()
        };
        assert!(format!("{:?}", config.system_adapter()).contains("Some(7)"));
        assert_eq!(config.apply_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_record_round() {
        let (router, _) = router();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        router.add_peer("g1", PathConfig::new("a", "wg-a", addr)).unwrap();

        let mut results = HashMap::new();
        results.insert(
            addr,
            ProbeStats {
                sent: 1,
                ..Default::default()
            },
        );
        router.record_round(&results);

        let snapshot = router.snapshot();
        let quality = snapshot[0].paths[0].quality;
        assert_eq!(quality.rounds, 1);
        assert!(quality.loss > 0.0);
        assert_eq!(router.destinations(), vec![addr]);
    }
}
