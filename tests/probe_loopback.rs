//! Live probing over loopback.
//!
//! Needs an ICMP socket: raw sockets need root, datagram sockets need the
//! process group in `net.ipv4.ping_group_range`. Tests return early when
//! neither is available.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;

use pathsteer::error::Result;
use pathsteer::multipath::{PathConfig, SelectorConfig};
use pathsteer::probe::{ProbeConfig, ProbeMode, Prober};
use pathsteer::routing::{RouteAdapter, Router, RouterConfig};
use pathsteer::Agent;

/// Accepts everything, keeps the real route table untouched.
struct NoopAdapter;

impl RouteAdapter for NoopAdapter {
    fn route_add(&self, _interface: &str, _gateway: Option<IpAddr>, _destination: &IpNetwork) -> Result<()> {
        Ok(())
    }

    fn route_del(&self, _interface: &str, _destination: &IpNetwork) -> Result<()> {
        Ok(())
    }

    fn route_replace(&self, _interface: &str, _gateway: Option<IpAddr>, _destination: &IpNetwork) -> Result<()> {
        Ok(())
    }

    fn route_conflict(&self, _destination: &IpNetwork) -> Result<Option<String>> {
        Ok(None)
    }
}

fn open_prober() -> Option<Prober> {
    for mode in [ProbeMode::Unprivileged, ProbeMode::Privileged] {
        let config = ProbeConfig {
            mode,
            ..Default::default()
        };
        if let Ok(prober) = Prober::new(&config) {
            return Some(prober);
        }
    }
    None
}

#[tokio::test]
async fn test_loopback_round() {
    let Some(prober) = open_prober() else {
        eprintln!("no ICMP socket available, skipping");
        return;
    };

    let lo: IpAddr = "127.0.0.1".parse().unwrap();
    let mut results = HashMap::new();
    prober.probe(&[lo, lo], Duration::from_millis(500), &mut results).await;

    // Duplicated input still probes once.
    let stats = results[&lo];
    assert_eq!(stats.sent, 1);
    assert!(stats.received <= 1);
    if let Some(rtt) = stats.rtt() {
        assert!(rtt < Duration::from_millis(500));
    }
}

#[tokio::test]
async fn test_empty_round_is_noop() {
    let Some(prober) = open_prober() else {
        return;
    };

    let mut results = HashMap::new();
    prober.probe(&[], Duration::from_millis(100), &mut results).await;
    let unspecified: IpAddr = "0.0.0.0".parse().unwrap();
    prober.probe(&[unspecified], Duration::from_millis(100), &mut results).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_agent_start_stop() {
    let Some(prober) = open_prober() else {
        return;
    };

    let router = Arc::new(Router::new(SelectorConfig::default(), Arc::new(NoopAdapter)));
    let lo: IpAddr = "127.0.0.1".parse().unwrap();
    router.add_peer("local", PathConfig::new("public", "lo", lo)).unwrap();

    let probe = ProbeConfig {
        interval: Duration::from_millis(200),
        timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let router_config = RouterConfig {
        apply_interval: Duration::from_millis(300),
        ..Default::default()
    };
    let agent = Agent::new(probe, router_config, Arc::clone(&router), Arc::new(prober));
    agent.start();

    tokio::time::sleep(Duration::from_millis(700)).await;
    agent.stop();
    tokio::time::timeout(Duration::from_secs(2), agent.join())
        .await
        .unwrap();

    assert!(agent.last_round().contains_key(&lo));
    let path = &router.snapshot()[0].paths[0];
    assert!(path.quality.rounds >= 1);
    assert!(path.installed);
}
