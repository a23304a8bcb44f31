//! Concurrent multi-destination ICMP prober.
//!
//! One round sends one echo request to every destination, all carrying the
//! same sequence number, then collects replies until the round timeout.
//! Send and receive tasks only report events; a single [`RoundCollector`]
//! folds them into per-destination statistics and commits the round in
//! one step.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::packet::{parse_reply, EchoReply, EchoRequest, Family, ICMP_HEADER_LEN, MIN_PAYLOAD_SIZE};
use super::socket::{open_icmp_socket, ProbeMode};
use super::ProbeConfig;
use crate::error::{Error, ProbeError, Result};
use crate::multipath::normalize_addr;

/// Outcome of one round for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStats {
    /// Echo requests sent (or attempted).
    pub sent: u32,
    /// Distinct replies accepted.
    pub received: u32,
    /// Extra replies for an already answered sequence.
    pub duplicates: u32,
    /// Round-trip time of the accepted reply.
    pub last_rtt: Option<Duration>,
    /// TTL of the accepted reply, when known.
    pub last_ttl: Option<u8>,
}

impl ProbeStats {
    /// RTT if the destination answered.
    pub fn rtt(&self) -> Option<Duration> {
        if self.received > 0 {
            self.last_rtt
        } else {
            None
        }
    }

    pub fn is_lost(&self) -> bool {
        self.received == 0
    }
}

/// Event reported by send and receive tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEvent {
    /// Echo request handed to the socket.
    Sent(IpAddr),
    /// Echo request could not be sent; counts as sent and unanswered.
    SendFailed(IpAddr),
    /// Matching echo reply.
    Reply {
        from: IpAddr,
        rtt: Duration,
        ttl: Option<u8>,
    },
}

/// Single writer of one round's statistics.
#[derive(Debug)]
pub struct RoundCollector {
    stats: HashMap<IpAddr, ProbeStats>,
}

impl RoundCollector {
    pub fn new<I: IntoIterator<Item = IpAddr>>(targets: I) -> Self {
        Self {
            stats: targets.into_iter().map(|a| (a, ProbeStats::default())).collect(),
        }
    }

    pub fn handle(&mut self, event: RoundEvent) {
        match event {
            RoundEvent::Sent(addr) | RoundEvent::SendFailed(addr) => {
                if let Some(s) = self.stats.get_mut(&addr) {
                    s.sent += 1;
                }
            }
            RoundEvent::Reply { from, rtt, ttl } => {
                // Replies from addresses outside this round are noise.
                let Some(s) = self.stats.get_mut(&from) else {
                    return;
                };
                if s.received == 0 {
                    s.received = 1;
                    s.last_rtt = Some(rtt);
                    s.last_ttl = ttl;
                } else {
                    s.duplicates += 1;
                }
            }
        }
    }

    pub fn get(&self, addr: &IpAddr) -> Option<&ProbeStats> {
        self.stats.get(addr)
    }

    /// Publish the round into the caller's map, replacing earlier entries
    /// for the same destinations.
    pub fn commit(self, results: &mut HashMap<IpAddr, ProbeStats>) {
        results.extend(self.stats);
    }
}

/// Fixed identity shared by all tasks of one round.
#[derive(Debug, Clone, Copy)]
struct RoundId {
    identifier: u16,
    sequence: u16,
    tracker: u64,
    epoch: Instant,
    check_identifier: bool,
}

impl RoundId {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Whether a decoded reply answers this round's request.
    ///
    /// Datagram sockets get their identifier rewritten by the kernel, so
    /// it is only compared in privileged mode.
    fn accepts(&self, reply: &EchoReply) -> bool {
        reply.tracker == self.tracker
            && reply.sequence == self.sequence
            && (!self.check_identifier || reply.identifier == self.identifier)
    }
}

/// ICMP prober. Cheap to share behind an `Arc`.
pub struct Prober {
    mode: ProbeMode,
    payload_size: usize,
    /// Random per-instance value rejecting replies of other sessions.
    tracker: u64,
    /// Echo identifier (only meaningful for raw sockets).
    identifier: u16,
    sequence: AtomicU16,
    epoch: Instant,
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl Prober {
    /// Open probe sockets. Fails if neither family can be opened.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        if config.payload_size < MIN_PAYLOAD_SIZE {
            return Err(ProbeError::PayloadTooSmall {
                size: config.payload_size,
                min: MIN_PAYLOAD_SIZE,
            }
            .into());
        }

        let v4 = open_icmp_socket(Family::V4, config.mode);
        let v6 = open_icmp_socket(Family::V6, config.mode);
        let (v4, v6) = match (v4, v6) {
            (Err(e), Err(_)) => return Err(e),
            (v4, v6) => (Self::keep(v4, Family::V4), Self::keep(v6, Family::V6)),
        };

        let prober = Self {
            mode: config.mode,
            payload_size: config.payload_size,
            tracker: rand::random(),
            identifier: rand::random(),
            sequence: AtomicU16::new(rand::random()),
            epoch: Instant::now(),
            v4,
            v6,
        };
        tracing::info!(
            mode = ?prober.mode,
            ipv4 = prober.v4.is_some(),
            ipv6 = prober.v6.is_some(),
            "Prober ready"
        );
        Ok(prober)
    }

    fn keep(socket: Result<UdpSocket>, family: Family) -> Option<Arc<UdpSocket>> {
        match socket {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                tracing::warn!(family = family.name(), error = %e, "ICMP family unavailable, skipping its destinations");
                None
            }
        }
    }

    /// A prober with no sockets; every round is empty.
    #[cfg(test)]
    pub(crate) fn without_sockets() -> Self {
        Self {
            mode: ProbeMode::Unprivileged,
            payload_size: MIN_PAYLOAD_SIZE,
            tracker: rand::random(),
            identifier: rand::random(),
            sequence: AtomicU16::new(0),
            epoch: Instant::now(),
            v4: None,
            v6: None,
        }
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    /// Per-instance tracker embedded in every request.
    pub fn tracker(&self) -> u64 {
        self.tracker
    }

    fn socket(&self, family: Family) -> Option<&Arc<UdpSocket>> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    /// Probe every address once, writing one entry per probed address into
    /// `results`.
    ///
    /// Returns when the timeout has elapsed, or earlier only if a socket
    /// breaks. Unspecified addresses and addresses of an unavailable family
    /// are skipped.
    pub async fn probe(&self, addresses: &[IpAddr], timeout: Duration, results: &mut HashMap<IpAddr, ProbeStats>) {
        let targets: HashSet<IpAddr> = addresses
            .iter()
            .map(|a| normalize_addr(*a))
            .filter(|a| !a.is_unspecified())
            .filter(|a| self.socket(Family::of(a)).is_some())
            .collect();
        if targets.is_empty() {
            return;
        }

        let round = RoundId {
            identifier: self.identifier,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            tracker: self.tracker,
            epoch: self.epoch,
            check_identifier: self.mode == ProbeMode::Privileged,
        };
        let deadline = tokio::time::Instant::now() + timeout;
        let targets = Arc::new(targets);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        // Receivers first, so no early reply is missed.
        for family in [Family::V4, Family::V6] {
            if !targets.iter().any(|a| Family::of(a) == family) {
                continue;
            }
            if let Some(socket) = self.socket(family) {
                tasks.spawn(receive(
                    Arc::clone(socket),
                    family,
                    round,
                    Arc::clone(&targets),
                    deadline,
                    self.payload_size,
                    tx.clone(),
                ));
            }
        }

        for addr in targets.iter().copied() {
            if let Some(socket) = self.socket(Family::of(&addr)) {
                tasks.spawn(send(Arc::clone(socket), addr, round, self.payload_size, deadline, tx.clone()));
            }
        }
        drop(tx);

        let mut collector = RoundCollector::new(targets.iter().copied());
        while let Some(event) = rx.recv().await {
            collector.handle(event);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Probe task failed");
            }
        }

        tracing::debug!(
            sequence = round.sequence,
            destinations = targets.len(),
            "Probe round complete"
        );
        collector.commit(results);
    }
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("mode", &self.mode)
            .field("payload_size", &self.payload_size)
            .field("ipv4", &self.v4.is_some())
            .field("ipv6", &self.v6.is_some())
            .finish()
    }
}

async fn send(
    socket: Arc<UdpSocket>,
    addr: IpAddr,
    round: RoundId,
    payload_size: usize,
    deadline: tokio::time::Instant,
    tx: mpsc::UnboundedSender<RoundEvent>,
) {
    let request = EchoRequest {
        identifier: round.identifier,
        sequence: round.sequence,
        tracker: round.tracker,
        sent_at: round.now_nanos(),
    };

    let result = match request.encode(Family::of(&addr), payload_size) {
        Ok(pkt) => match tokio::time::timeout_at(deadline, socket.send_to(&pkt, SocketAddr::new(addr, 0))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::from(ProbeError::SendFailed {
                addr,
                reason: e.to_string(),
            })),
            Err(_) => Err(Error::from(ProbeError::SendFailed {
                addr,
                reason: "round timed out before the request was sent".into(),
            })),
        },
        Err(e) => Err(e.into()),
    };

    let event = match result {
        Ok(()) => RoundEvent::Sent(addr),
        Err(e) if e.is_transient() => {
            tracing::debug!(destination = %addr, error = %e, "Probe send failed");
            RoundEvent::SendFailed(addr)
        }
        Err(e) => {
            tracing::warn!(destination = %addr, error = %e, "Probe request not built");
            RoundEvent::SendFailed(addr)
        }
    };
    let _ = tx.send(event);
}

async fn receive(
    socket: Arc<UdpSocket>,
    family: Family,
    round: RoundId,
    targets: Arc<HashSet<IpAddr>>,
    deadline: tokio::time::Instant,
    payload_size: usize,
    tx: mpsc::UnboundedSender<RoundEvent>,
) {
    // Room for an IPv4 header with options in front of the echo.
    let mut buf = vec![0u8; 60 + ICMP_HEADER_LEN + payload_size];

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(e)) if is_retryable(&e) => continue,
            Ok(Err(e)) => {
                let e = ProbeError::ReceiveFailed(e.to_string());
                tracing::warn!(family = family.name(), error = %e, "Probe socket failed, ending round");
                break;
            }
        };

        let from = normalize_addr(from.ip());
        if !targets.contains(&from) {
            continue;
        }

        let reply = match parse_reply(&buf[..len], family) {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(source = %from, error = %e, "Ignoring malformed reply");
                continue;
            }
        };

        if !round.accepts(&reply) {
            continue;
        }

        let rtt = Duration::from_nanos(round.now_nanos().saturating_sub(reply.sent_at));
        let _ = tx.send(RoundEvent::Reply {
            from,
            rtt,
            ttl: reply.ttl,
        });
    }
}

fn is_retryable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn round(check_identifier: bool) -> RoundId {
        RoundId {
            identifier: 0x4242,
            sequence: 9,
            tracker: 0x0123_4567_89ab_cdef,
            epoch: Instant::now(),
            check_identifier,
        }
    }

    fn reply_to(round: &RoundId) -> EchoReply {
        EchoReply {
            identifier: round.identifier,
            sequence: round.sequence,
            tracker: round.tracker,
            sent_at: 0,
            ttl: None,
        }
    }

    #[test]
    fn test_matching_reply_accepted() {
        let round = round(true);
        assert!(round.accepts(&reply_to(&round)));
    }

    #[test]
    fn test_foreign_tracker_rejected() {
        let round = round(false);
        let reply = EchoReply {
            tracker: round.tracker ^ 1,
            ..reply_to(&round)
        };
        assert!(!round.accepts(&reply));
    }

    #[test]
    fn test_stale_sequence_rejected() {
        let round = round(false);
        let reply = EchoReply {
            sequence: round.sequence.wrapping_sub(1),
            ..reply_to(&round)
        };
        assert!(!round.accepts(&reply));
    }

    #[test]
    fn test_identifier_checked_only_when_privileged() {
        let privileged = round(true);
        let reply = EchoReply {
            identifier: 7,
            ..reply_to(&privileged)
        };
        assert!(!privileged.accepts(&reply));

        let unprivileged = round(false);
        assert!(unprivileged.accepts(&reply));
    }

    #[tokio::test]
    async fn test_send_gives_up_at_deadline() {
        let socket = match UdpSocket::bind("127.0.0.1:0").await {
            Ok(socket) => Arc::new(socket),
            Err(_) => return,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = addr("127.0.0.1");

        // A deadline already in the past ends the send without waiting.
        let deadline = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::timeout(
            Duration::from_secs(1),
            send(socket, a, round(false), MIN_PAYLOAD_SIZE, deadline, tx),
        )
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RoundEvent::Sent(x) | RoundEvent::SendFailed(x) if x == a));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_duplicate_reply_counted_once() {
        let a = addr("10.0.0.1");
        let mut collector = RoundCollector::new([a]);
        collector.handle(RoundEvent::Sent(a));
        for ms in [12, 15] {
            collector.handle(RoundEvent::Reply {
                from: a,
                rtt: Duration::from_millis(ms),
                ttl: Some(60),
            });
        }

        let stats = collector.get(&a).unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.rtt(), Some(Duration::from_millis(12)));
    }

    #[test]
    fn test_unanswered_is_lost() {
        let a = addr("10.0.0.1");
        let b = addr("10.0.0.2");
        let mut collector = RoundCollector::new([a, b]);
        collector.handle(RoundEvent::Sent(a));
        collector.handle(RoundEvent::SendFailed(b));

        let mut results = HashMap::new();
        collector.commit(&mut results);
        assert!(results[&a].is_lost());
        assert_eq!(results[&b].sent, 1);
        assert_eq!(results[&b].rtt(), None);
    }

    #[test]
    fn test_reply_from_stranger_ignored() {
        let a = addr("10.0.0.1");
        let mut collector = RoundCollector::new([a]);
        collector.handle(RoundEvent::Reply {
            from: addr("192.0.2.9"),
            rtt: Duration::from_millis(1),
            ttl: None,
        });
        assert!(collector.get(&addr("192.0.2.9")).is_none());
        assert_eq!(collector.get(&a).unwrap().received, 0);
    }

    #[test]
    fn test_commit_replaces_previous_round() {
        let a = addr("2001:db8::1");
        let mut results = HashMap::new();
        results.insert(
            a,
            ProbeStats {
                sent: 1,
                received: 1,
                last_rtt: Some(Duration::from_millis(3)),
                ..Default::default()
            },
        );

        let mut collector = RoundCollector::new([a]);
        collector.handle(RoundEvent::Sent(a));
        collector.commit(&mut results);
        assert!(results[&a].is_lost());
    }
}
