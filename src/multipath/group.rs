//! Route groups and their service routes.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use super::path::normalize_prefix;
use super::selector::momentary_best;
use super::{Path, PathConfig, PathSelector, SelectorConfig};
use crate::metrics::PathQuality;
use crate::types::{ConnectionId, GroupId, PathFlags, SelectedRoute};

/// Route currently present in the OS table for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRoute {
    pub connection: ConnectionId,
    pub interface: String,
    pub gateway: Option<IpAddr>,
}

/// What reconciliation has to do for one service prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    /// OS state already matches.
    Keep,
    /// Nothing installed yet; add a route through this candidate.
    SetRoute(ConnectionId),
    /// Installed through another candidate; replace it.
    MergeRoutes { from: ConnectionId, to: ConnectionId },
    /// Remove the installed route.
    ClearRoute,
}

/// A destination prefix reachable through one or more paths of a group.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    prefix: IpNetwork,
    candidates: BTreeMap<ConnectionId, PathFlags>,
    active: Option<ActiveRoute>,
    flags: PathFlags,
    claim: u64,
}

impl ServiceRoute {
    fn new(prefix: IpNetwork, claim: u64) -> Self {
        Self {
            prefix,
            candidates: BTreeMap::new(),
            active: None,
            flags: PathFlags::NONE,
            claim,
        }
    }

    pub fn prefix(&self) -> IpNetwork {
        self.prefix
    }

    pub fn candidates(&self) -> &BTreeMap<ConnectionId, PathFlags> {
        &self.candidates
    }

    /// Candidates not marked for deletion.
    pub fn live_candidates(&self) -> impl Iterator<Item = &ConnectionId> {
        self.candidates
            .iter()
            .filter(|(_, f)| !f.is_pending_del())
            .map(|(c, _)| c)
    }

    /// Number of candidates still referencing this prefix.
    pub fn ref_count(&self) -> usize {
        self.live_candidates().count()
    }

    pub fn pending_adds(&self) -> usize {
        self.candidates.values().filter(|f| f.is_pending_add()).count()
    }

    pub fn pending_dels(&self) -> usize {
        self.candidates.values().filter(|f| f.is_pending_del()).count()
    }

    pub fn active(&self) -> Option<&ActiveRoute> {
        self.active.as_ref()
    }

    pub(crate) fn set_active(&mut self, active: Option<ActiveRoute>) {
        self.active = active;
    }

    pub fn flags(&self) -> PathFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut PathFlags {
        &mut self.flags
    }

    pub fn claim(&self) -> u64 {
        self.claim
    }

    /// All candidates are being removed.
    pub fn is_cleared(&self) -> bool {
        self.ref_count() == 0
    }

    /// Decide the OS operation that moves this service to `desired`.
    pub fn plan(&self, desired: Option<&ConnectionId>) -> ServiceAction {
        let active = self.active.as_ref().map(|a| &a.connection);
        if self.is_cleared() || self.flags.is_disabled() {
            return match active {
                Some(_) => ServiceAction::ClearRoute,
                None => ServiceAction::Keep,
            };
        }

        match (active, desired) {
            (None, None) => ServiceAction::Keep,
            (None, Some(to)) => ServiceAction::SetRoute(to.clone()),
            (Some(_), None) => ServiceAction::ClearRoute,
            (Some(from), Some(to)) if from == to => ServiceAction::Keep,
            (Some(from), Some(to)) => ServiceAction::MergeRoutes {
                from: from.clone(),
                to: to.clone(),
            },
        }
    }

    /// Drop candidates whose deletion has been applied.
    pub(crate) fn commit(&mut self) {
        self.candidates.retain(|_, f| !f.is_pending_del());
        for flags in self.candidates.values_mut() {
            flags.clear(PathFlags::PENDING_ADD);
        }
    }
}

/// Status view of one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStatus {
    pub connection: ConnectionId,
    pub interface: String,
    pub address: IpAddr,
    pub flags: PathFlags,
    pub installed: bool,
    pub quality: PathQuality,
}

/// Status view of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub id: GroupId,
    pub paths: Vec<PathStatus>,
    pub services: Vec<(IpNetwork, Option<ConnectionId>)>,
    pub selection: Option<SelectedRoute>,
}

/// All paths and services of one connection group.
#[derive(Debug)]
pub struct RouteGroup {
    id: GroupId,
    paths: BTreeMap<ConnectionId, Path>,
    services: HashMap<IpNetwork, ServiceRoute>,
    selector: PathSelector,
    selection: Option<SelectedRoute>,
}

impl RouteGroup {
    pub fn new(id: GroupId, config: SelectorConfig) -> Self {
        Self {
            id,
            paths: BTreeMap::new(),
            services: HashMap::new(),
            selector: PathSelector::new(config),
            selection: None,
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn paths(&self) -> &BTreeMap<ConnectionId, Path> {
        &self.paths
    }

    pub(crate) fn paths_mut(&mut self) -> &mut BTreeMap<ConnectionId, Path> {
        &mut self.paths
    }

    pub fn path(&self, connection: &ConnectionId) -> Option<&Path> {
        self.paths.get(connection)
    }

    pub fn services(&self) -> &HashMap<IpNetwork, ServiceRoute> {
        &self.services
    }

    pub(crate) fn services_mut(&mut self) -> &mut HashMap<IpNetwork, ServiceRoute> {
        &mut self.services
    }

    pub fn selection(&self) -> Option<&SelectedRoute> {
        self.selection.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.services.is_empty()
    }

    /// Register a path or refresh an existing one. Returns true for a new
    /// path.
    pub(crate) fn add_path(&mut self, config: PathConfig, claim: u64) -> bool {
        match self.paths.get_mut(&config.connection) {
            Some(path) => {
                path.update(config);
                false
            }
            None => {
                let window = self.selector.config().window_size;
                let path = Path::new(config, self.id.clone(), window, claim);
                self.paths.insert(path.connection().clone(), path);
                true
            }
        }
    }

    /// Mark a path for deletion, along with its service candidacies.
    pub(crate) fn del_path(&mut self, connection: &ConnectionId) -> bool {
        let Some(path) = self.paths.get_mut(connection) else {
            return false;
        };
        path.flags_mut().set(PathFlags::PENDING_DEL);
        path.flags_mut().clear(PathFlags::PENDING_ADD);

        for service in self.services.values_mut() {
            if let Some(flags) = service.candidates.get_mut(connection) {
                flags.set(PathFlags::PENDING_DEL);
            }
        }
        true
    }

    pub(crate) fn add_service(&mut self, prefix: IpNetwork, connection: ConnectionId, claim: u64) {
        let prefix = normalize_prefix(prefix);
        let service = self
            .services
            .entry(prefix)
            .or_insert_with(|| ServiceRoute::new(prefix, claim));
        let flags = service.candidates.entry(connection).or_default();
        flags.clear(PathFlags::PENDING_DEL);
        flags.set(PathFlags::PENDING_ADD);
    }

    pub(crate) fn del_service(&mut self, prefix: IpNetwork, connection: &ConnectionId) -> bool {
        let prefix = normalize_prefix(prefix);
        match self
            .services
            .get_mut(&prefix)
            .and_then(|s| s.candidates.get_mut(connection))
        {
            Some(flags) => {
                flags.set(PathFlags::PENDING_DEL);
                flags.clear(PathFlags::PENDING_ADD);
                true
            }
            None => false,
        }
    }

    /// Mark everything for deletion.
    pub(crate) fn flush(&mut self) {
        for path in self.paths.values_mut() {
            path.flags_mut().set(PathFlags::PENDING_DEL);
            path.flags_mut().clear(PathFlags::PENDING_ADD);
        }
        for service in self.services.values_mut() {
            for flags in service.candidates.values_mut() {
                flags.set(PathFlags::PENDING_DEL);
                flags.clear(PathFlags::PENDING_ADD);
            }
        }
    }

    /// Run the selector over the current paths.
    pub(crate) fn reselect(&mut self) -> &SelectedRoute {
        let route = self.selector.best_path(&self.paths);
        self.selection.insert(route)
    }

    /// Connection a service should be routed through.
    ///
    /// The group selection wins when it is one of the service's candidates;
    /// otherwise the best valid candidate is used, unless the group route
    /// was deleted.
    pub fn desired_for(&self, service: &ServiceRoute) -> Option<ConnectionId> {
        let live: Vec<&ConnectionId> = service
            .live_candidates()
            .filter(|c| self.paths.get(*c).is_some_and(Path::valid))
            .collect();

        let selection = self.selection.as_ref()?;
        if let Some(selected) = &selection.connection {
            if live.contains(&selected) {
                return Some(selected.clone());
            }
        }
        if selection.is_delete() {
            return None;
        }

        momentary_best(live.iter().filter_map(|c| self.paths.get(*c)))
            .map(|p| p.connection().clone())
    }

    pub fn status(&self) -> GroupStatus {
        let mut services: Vec<_> = self
            .services
            .values()
            .map(|s| (s.prefix, s.active.as_ref().map(|a| a.connection.clone())))
            .collect();
        services.sort_by_key(|(prefix, _)| *prefix);

        GroupStatus {
            id: self.id.clone(),
            paths: self
                .paths
                .values()
                .map(|p| PathStatus {
                    connection: p.connection().clone(),
                    interface: p.interface().to_string(),
                    address: p.address(),
                    flags: p.flags(),
                    installed: p.is_installed(),
                    quality: p.quality(),
                })
                .collect(),
            services,
            selection: self.selection.clone(),
        }
    }
}
