//! OS route table access.
//!
//! The reconciler talks to the route table only through [`RouteAdapter`],
//! so tests can substitute an in-memory table.

use std::net::IpAddr;
use std::process::{Command, Output};

use ipnetwork::IpNetwork;

use crate::error::{Result, RouteError};

/// Route table operations used by the reconciler.
///
/// Adding a route that already exists on the same interface must succeed.
/// Deleting a route that does not exist must succeed.
pub trait RouteAdapter: Send + Sync {
    /// Add `destination` through `interface`, optionally via `gateway`.
    fn route_add(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()>;

    /// Remove `destination` from `interface`.
    fn route_del(&self, interface: &str, destination: &IpNetwork) -> Result<()>;

    /// Atomically point `destination` at `interface`.
    fn route_replace(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()>;

    /// Interface currently holding exactly `destination`, if any.
    fn route_conflict(&self, destination: &IpNetwork) -> Result<Option<String>>;
}

/// Route adapter backed by the system `ip` (Linux) or `route` (macOS) tools.
#[derive(Debug, Clone, Default)]
pub struct SystemRouteAdapter {
    /// Routing table to operate on (Linux).
    table: Option<u32>,
}

impl SystemRouteAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a dedicated routing table instead of main (Linux only).
    pub fn with_table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    #[cfg(target_os = "linux")]
    fn ip_route(&self, verb: &str, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<Output> {
        let destination = destination.to_string();
        let gateway = gateway.map(|gw| gw.to_string());
        let table = self.table.map(|t| t.to_string());

        let mut args = vec!["route", verb, destination.as_str()];
        if let Some(ref gw) = gateway {
            args.push("via");
            args.push(gw);
        }
        args.push("dev");
        args.push(interface);
        if let Some(ref table) = table {
            args.push("table");
            args.push(table);
        }

        Ok(Command::new("ip").args(&args).output()?)
    }

    #[cfg(target_os = "macos")]
    fn route_cmd(&self, verb: &str, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<Output> {
        let destination = destination.to_string();
        let gateway = gateway.map(|gw| gw.to_string());
        let family = if destination.contains(':') { "-inet6" } else { "-inet" };

        let mut args = vec!["-n", verb, family, "-net", destination.as_str()];
        if let Some(ref gw) = gateway {
            args.push("-gateway");
            args.push(gw);
        } else if verb != "delete" {
            args.push("-interface");
            args.push(interface);
        }

        Ok(Command::new("route").args(&args).output()?)
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[cfg(target_os = "linux")]
impl RouteAdapter for SystemRouteAdapter {
    fn route_add(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
        let output = self.ip_route("add", interface, gateway, destination)?;
        if !output.status.success() {
            let stderr = stderr(&output);
            if !stderr.contains("File exists") {
                return Err(RouteError::AddFailed {
                    destination: destination.to_string(),
                    interface: interface.to_string(),
                    reason: stderr,
                }
                .into());
            }
        }

        tracing::debug!(destination = %destination, interface = %interface, "Added route");
        Ok(())
    }

    fn route_del(&self, interface: &str, destination: &IpNetwork) -> Result<()> {
        let output = self.ip_route("del", interface, None, destination)?;
        if !output.status.success() {
            let stderr = stderr(&output);
            if !stderr.contains("No such process") {
                return Err(RouteError::DeleteFailed {
                    destination: destination.to_string(),
                    interface: interface.to_string(),
                    reason: stderr,
                }
                .into());
            }
        }

        tracing::debug!(destination = %destination, interface = %interface, "Removed route");
        Ok(())
    }

    fn route_replace(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
        let output = self.ip_route("replace", interface, gateway, destination)?;
        if !output.status.success() {
            return Err(RouteError::ReplaceFailed {
                destination: destination.to_string(),
                interface: interface.to_string(),
                reason: stderr(&output),
            }
            .into());
        }

        tracing::debug!(destination = %destination, interface = %interface, "Replaced route");
        Ok(())
    }

    fn route_conflict(&self, destination: &IpNetwork) -> Result<Option<String>> {
        let destination = destination.to_string();
        let table = self.table.map_or_else(|| "main".to_string(), |t| t.to_string());
        let family = if destination.contains(':') { "-6" } else { "-4" };

        let output = Command::new("ip")
            .args([family, "-o", "route", "show", "exact", &destination, "table", &table])
            .output()?;
        if !output.status.success() {
            return Err(RouteError::LookupFailed(stderr(&output)).into());
        }

        // Parse: 10.1.0.0/16 via 10.0.0.1 dev wg0 proto static
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_dev(&stdout))
    }
}

#[cfg(target_os = "macos")]
impl RouteAdapter for SystemRouteAdapter {
    fn route_add(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
        let output = self.route_cmd("add", interface, gateway, destination)?;
        if !output.status.success() {
            let stderr = stderr(&output);
            if !stderr.contains("File exists") {
                return Err(RouteError::AddFailed {
                    destination: destination.to_string(),
                    interface: interface.to_string(),
                    reason: stderr,
                }
                .into());
            }
        }

        tracing::debug!(destination = %destination, interface = %interface, "Added route");
        Ok(())
    }

    fn route_del(&self, interface: &str, destination: &IpNetwork) -> Result<()> {
        let output = self.route_cmd("delete", interface, None, destination)?;
        if !output.status.success() {
            let stderr = stderr(&output);
            if !stderr.contains("not in table") {
                return Err(RouteError::DeleteFailed {
                    destination: destination.to_string(),
                    interface: interface.to_string(),
                    reason: stderr,
                }
                .into());
            }
        }

        tracing::debug!(destination = %destination, interface = %interface, "Removed route");
        Ok(())
    }

    fn route_replace(&self, interface: &str, gateway: Option<IpAddr>, destination: &IpNetwork) -> Result<()> {
        let output = self.route_cmd("change", interface, gateway, destination)?;
        if output.status.success() {
            tracing::debug!(destination = %destination, interface = %interface, "Replaced route");
            return Ok(());
        }

        // `change` fails when nothing is installed yet.
        self.route_add(interface, gateway, destination)
    }

    fn route_conflict(&self, destination: &IpNetwork) -> Result<Option<String>> {
        let dest = destination.to_string();
        let output = Command::new("route").args(["-n", "get", "-net", &dest]).output()?;
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut route_dest = None;
        let mut mask = None;
        let mut interface = None;
        for line in stdout.lines() {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("destination:") {
                route_dest = v.trim().parse::<IpAddr>().ok();
            } else if let Some(v) = line.strip_prefix("mask:") {
                mask = v.trim().parse::<IpAddr>().ok();
            } else if let Some(v) = line.strip_prefix("interface:") {
                interface = Some(v.trim().to_string());
            }
        }

        // `route get` answers with the best match; only an exact one counts.
        let exact = match (route_dest, mask) {
            (Some(d), Some(m)) => IpNetwork::with_netmask(d, m).ok() == Some(*destination),
            (Some(d), None) => d == destination.ip() && destination.prefix() == if d.is_ipv4() { 32 } else { 128 },
            _ => false,
        };
        Ok(if exact { interface } else { None })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl RouteAdapter for SystemRouteAdapter {
    fn route_add(&self, _interface: &str, _gateway: Option<IpAddr>, _destination: &IpNetwork) -> Result<()> {
        Err(RouteError::Unsupported.into())
    }

    fn route_del(&self, _interface: &str, _destination: &IpNetwork) -> Result<()> {
        Err(RouteError::Unsupported.into())
    }

    fn route_replace(&self, _interface: &str, _gateway: Option<IpAddr>, _destination: &IpNetwork) -> Result<()> {
        Err(RouteError::Unsupported.into())
    }

    fn route_conflict(&self, _destination: &IpNetwork) -> Result<Option<String>> {
        Err(RouteError::Unsupported.into())
    }
}

/// Extract the `dev` field of the first line of `ip -o route` output.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_dev(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "dev" {
                return parts.next().map(str::to_string);
            }
        }
        None
    })
}
