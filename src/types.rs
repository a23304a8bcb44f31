//! Core types used throughout pathsteer.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controller-assigned identifier of a connection group.
///
/// All paths and service routes of one group reroute together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one connection (public path or one overlay tunnel).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Connection id reserved for the direct internet path.
    pub const PUBLIC: &'static str = "public";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The designated direct (non-overlay) connection.
    pub fn public() -> Self {
        Self(Self::PUBLIC.to_string())
    }

    pub fn is_public(&self) -> bool {
        self.0 == Self::PUBLIC
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Two-phase commit flags carried by paths and service candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PathFlags(u8);

impl PathFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Route must be installed on the next apply.
    pub const PENDING_ADD: u8 = 1 << 0;

    /// Route must be removed on the next apply.
    pub const PENDING_DEL: u8 = 1 << 1;

    /// Entry lost a conflict with another group.
    pub const DISABLED: u8 = 1 << 2;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Check if a flag is set.
    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Set a flag.
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Clear a flag.
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_pending_add(self) -> bool {
        self.has(Self::PENDING_ADD)
    }

    pub fn is_pending_del(self) -> bool {
        self.has(Self::PENDING_DEL)
    }

    pub fn is_disabled(self) -> bool {
        self.has(Self::DISABLED)
    }
}

impl fmt::Display for PathFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_pending_add() {
            parts.push("pending-add");
        }
        if self.is_pending_del() {
            parts.push("pending-del");
        }
        if self.is_disabled() {
            parts.push("disabled");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

impl Serialize for PathFlags {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> Deserialize<'de> for PathFlags {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(u8::deserialize(deserializer)?))
    }
}

/// Why a selection result differs (or not) from the previous one.
///
/// Informational only: route reconciliation never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ChangeReason {
    /// Selection kept the previous path.
    NoChange,
    /// No previous selection existed.
    NewRoute,
    /// Switched because the new path loses fewer probes.
    LossImproved { old: f64, new: f64 },
    /// Switched because the new path clears the latency hysteresis.
    LatencyImproved { old: Duration, new: Duration },
    /// No usable path, or the chosen path crossed the loss threshold.
    RouteDeleted { loss: Option<f64> },
}

impl ChangeReason {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChange => write!(f, "no change"),
            Self::NewRoute => write!(f, "new route"),
            Self::LossImproved { old, new } => {
                write!(f, "loss improved {:.1}% -> {:.1}%", old * 100.0, new * 100.0)
            }
            Self::LatencyImproved { old, new } => write!(
                f,
                "latency improved {:.1}ms -> {:.1}ms",
                old.as_secs_f64() * 1000.0,
                new.as_secs_f64() * 1000.0
            ),
            Self::RouteDeleted { loss: Some(loss) } => {
                write!(f, "route deleted (loss {:.1}%)", loss * 100.0)
            }
            Self::RouteDeleted { loss: None } => write!(f, "route deleted"),
        }
    }
}

/// Output of a path selection for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRoute {
    /// Address of the chosen path; `None` means the group route is deleted.
    pub address: Option<IpAddr>,
    /// Connection the chosen path belongs to.
    pub connection: Option<ConnectionId>,
    /// Why this result was produced.
    pub reason: ChangeReason,
}

impl SelectedRoute {
    /// A selection that removes the group route.
    pub fn deleted(loss: Option<f64>) -> Self {
        Self {
            address: None,
            connection: None,
            reason: ChangeReason::RouteDeleted { loss },
        }
    }

    pub fn is_delete(&self) -> bool {
        self.address.is_none()
    }
}
