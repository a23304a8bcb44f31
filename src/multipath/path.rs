//! Individual path (one connection's way of reaching a peer).

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::metrics::{PathQuality, SampleWindow};
use crate::types::{ConnectionId, GroupId, PathFlags};

/// Description of a path as handed over by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Connection this path belongs to (`"public"` for the direct path).
    pub connection: ConnectionId,
    /// Interface the route is installed on (e.g. "eth0", "wg-eu1").
    pub interface: String,
    /// Next hop, if the interface is not point-to-point.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    /// Peer address reached (and probed) through this path.
    pub address: IpAddr,
}

impl PathConfig {
    pub fn new(connection: impl Into<ConnectionId>, interface: impl Into<String>, address: IpAddr) -> Self {
        Self {
            connection: connection.into(),
            interface: interface.into(),
            gateway: None,
            address,
        }
    }

    /// Set the gateway.
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }
}

/// Map IPv4-mapped IPv6 addresses to plain IPv4 so one host has one key.
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

/// Host prefix (/32 or /128) for an address.
pub fn host_prefix(addr: IpAddr) -> IpNetwork {
    let addr = normalize_addr(addr);
    let len = if addr.is_ipv4() { 32 } else { 128 };
    // A full-length prefix is always valid for its family.
    IpNetwork::new(addr, len).unwrap_or_else(|_| IpNetwork::from(addr))
}

/// Zero the host bits of a prefix.
pub fn normalize_prefix(prefix: IpNetwork) -> IpNetwork {
    let network = normalize_addr(prefix.network());
    let len = match (prefix.ip(), network) {
        (IpAddr::V6(_), IpAddr::V4(_)) => prefix.prefix().saturating_sub(96),
        _ => prefix.prefix(),
    };
    IpNetwork::new(network, len).unwrap_or(prefix)
}

/// A path to a peer through one connection, with its probe history.
#[derive(Debug, Clone)]
pub struct Path {
    config: PathConfig,
    group: GroupId,
    flags: PathFlags,
    window: SampleWindow,
    /// Interface the host route is currently installed on.
    installed: Option<String>,
    /// Order in which the address was claimed, used to break conflicts.
    claim: u64,
}

impl Path {
    /// Create a path that still has to be installed.
    pub fn new(mut config: PathConfig, group: GroupId, window_size: usize, claim: u64) -> Self {
        config.address = normalize_addr(config.address);
        let mut flags = PathFlags::NONE;
        flags.set(PathFlags::PENDING_ADD);

        Self {
            config,
            group,
            flags,
            window: SampleWindow::new(window_size),
            installed: None,
            claim,
        }
    }

    pub fn config(&self) -> &PathConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.config.connection
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.config.gateway
    }

    pub fn address(&self) -> IpAddr {
        self.config.address
    }

    /// Host route this path installs for its peer address.
    pub fn destination(&self) -> IpNetwork {
        host_prefix(self.config.address)
    }

    /// Next hop to use when routing a service through this path.
    pub fn next_hop(&self) -> IpAddr {
        self.config.gateway.unwrap_or(self.config.address)
    }

    /// Whether this is the designated direct path.
    pub fn is_public(&self) -> bool {
        self.config.connection.is_public()
    }

    pub fn flags(&self) -> PathFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut PathFlags {
        &mut self.flags
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    pub fn installed_interface(&self) -> Option<&str> {
        self.installed.as_deref()
    }

    pub(crate) fn set_installed(&mut self, interface: Option<String>) {
        self.installed = interface;
    }

    pub fn claim(&self) -> u64 {
        self.claim
    }

    /// Update the route description, keeping history. Returns true when
    /// the installed route has to be rewritten.
    pub(crate) fn update(&mut self, config: PathConfig) -> bool {
        let mut config = config;
        config.address = normalize_addr(config.address);
        let changed = config.interface != self.config.interface
            || config.gateway != self.config.gateway
            || config.address != self.config.address;

        if config.address != self.config.address {
            self.window.reset();
        }
        self.config = config;
        self.flags.clear(PathFlags::PENDING_DEL);
        if changed || self.installed.is_none() {
            self.flags.set(PathFlags::PENDING_ADD);
        }
        changed
    }

    /// Record one probe round.
    pub fn record(&mut self, latency: Duration, loss_hit: bool) {
        self.window.record(latency, loss_hit);
    }

    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Mean latency over responsive rounds.
    pub fn latency(&self) -> Duration {
        self.window.latency()
    }

    /// Loss ratio over the full window.
    pub fn loss(&self) -> f64 {
        self.window.loss()
    }

    /// True until every window slot holds a latency sample.
    pub fn incomplete(&self) -> bool {
        self.window.incomplete()
    }

    /// Eligible for selection: not disabled, not being deleted, and probed
    /// at least once.
    pub fn valid(&self) -> bool {
        !self.flags.is_disabled() && !self.flags.is_pending_del() && !self.window.is_empty()
    }

    pub fn quality(&self) -> PathQuality {
        PathQuality::from_window(&self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn path(conn: &str, addr: &str) -> Path {
        Path::new(
            PathConfig::new(conn, "wg0", addr.parse().unwrap()),
            GroupId::new("g"),
            4,
            1,
        )
    }

    #[test]
    fn test_new_path_is_pending_and_invalid() {
        let p = path("t1", "10.0.0.1");
        assert!(p.flags().is_pending_add());
        assert!(!p.valid());
        assert_eq!(p.destination().to_string(), "10.0.0.1/32");
    }

    #[test]
    fn test_valid_after_lossy_round() {
        let mut p = path("t1", "10.0.0.1");
        p.record(Duration::ZERO, true);
        assert!(p.valid());

        p.flags_mut().set(PathFlags::DISABLED);
        assert!(!p.valid());
    }

    #[test]
    fn test_mapped_address_is_normalized() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped());
        let p = Path::new(PathConfig::new("t1", "wg0", mapped), GroupId::new("g"), 4, 1);
        assert_eq!(p.address(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));

        let v6 = host_prefix(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(v6.prefix(), 128);
    }

    #[test]
    fn test_normalize_prefix() {
        let prefix: IpNetwork = "10.1.2.3/16".parse().unwrap();
        assert_eq!(normalize_prefix(prefix).to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_update_resets_history_on_new_address() {
        let mut p = path("t1", "10.0.0.1");
        p.record(Duration::from_millis(5), false);
        p.set_installed(Some("wg0".into()));
        p.flags_mut().clear(PathFlags::PENDING_ADD);

        assert!(!p.update(PathConfig::new("t1", "wg0", "10.0.0.1".parse().unwrap())));
        assert!(!p.flags().is_pending_add());
        assert!(!p.window().is_empty());

        assert!(p.update(PathConfig::new("t1", "wg0", "10.0.0.2".parse().unwrap())));
        assert!(p.flags().is_pending_add());
        assert!(p.window().is_empty());
    }
}
