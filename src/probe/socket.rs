//! ICMP socket creation.
//!
//! Privileged mode opens raw ICMP sockets (root or CAP_NET_RAW). Unprivileged
//! mode uses datagram ICMP sockets, which Linux allows for groups listed in
//! `net.ipv4.ping_group_range` and macOS allows for everyone.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use super::packet::Family;
use crate::error::{ProbeError, Result};

/// Receive buffer requested for probe sockets.
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// How probe sockets are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Raw ICMP sockets; echo identifiers are ours to choose and check.
    #[default]
    Privileged,
    /// Datagram ICMP sockets; the kernel owns the echo identifier.
    Unprivileged,
}

impl ProbeMode {
    fn socket_type(self) -> Type {
        match self {
            Self::Privileged => Type::RAW,
            Self::Unprivileged => Type::DGRAM,
        }
    }
}

/// Open a non-blocking ICMP socket for `family` and hand it to tokio.
///
/// Must be called from within a tokio runtime.
pub fn open_icmp_socket(family: Family, mode: ProbeMode) -> Result<UdpSocket> {
    let (domain, protocol) = match family {
        Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
        Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };

    let unavailable = |e: std::io::Error| ProbeError::SocketUnavailable {
        family: family.name(),
        reason: e.to_string(),
    };

    let socket = Socket::new(domain, mode.socket_type(), Some(protocol)).map_err(unavailable)?;

    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        debug!(family = family.name(), error = %e, "Could not enlarge probe receive buffer");
    }
    socket.set_nonblocking(true).map_err(unavailable)?;

    let socket = UdpSocket::from_std(socket.into()).map_err(unavailable)?;
    debug!(family = family.name(), mode = ?mode, "Opened ICMP socket");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ProbeMode,
        }
        let w: Wrapper = toml::from_str("mode = \"unprivileged\"").unwrap();
        assert_eq!(w.mode, ProbeMode::Unprivileged);
        assert_eq!(ProbeMode::default(), ProbeMode::Privileged);
    }
}
