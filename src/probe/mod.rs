//! ICMP path probing.

mod packet;
mod prober;
mod socket;

pub use packet::{checksum, parse_reply, EchoReply, EchoRequest, Family, ICMP_HEADER_LEN, MIN_PAYLOAD_SIZE};
pub use prober::{ProbeStats, Prober, RoundCollector, RoundEvent};
pub use socket::{open_icmp_socket, ProbeMode};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Socket mode.
    #[serde(default)]
    pub mode: ProbeMode,

    /// Interval between probe rounds.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Time to wait for replies in one round.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Echo payload size in bytes.
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
}

fn default_interval() -> Duration { Duration::from_secs(2) }
fn default_timeout() -> Duration { Duration::from_secs(1) }
fn default_payload_size() -> usize { MIN_PAYLOAD_SIZE }

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            interval: default_interval(),
            timeout: default_timeout(),
            payload_size: default_payload_size(),
        }
    }
}
