//! Path selection scenarios for both strategies.
//!
//! Paths are fed synthetic probe rounds and the selector is exercised the
//! way the router does it: one `best_path` call per apply.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use pathsteer::multipath::{Path, PathConfig, PathSelector, SelectionStrategy, SelectorConfig};
use pathsteer::types::{ChangeReason, ConnectionId, GroupId};

const WINDOW: usize = 10;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn new_path(connection: &str, index: u8) -> Path {
    let address = IpAddr::from([10, 0, index, 1]);
    Path::new(
        PathConfig::new(connection, format!("if{index}"), address),
        GroupId::new("group-1"),
        WINDOW,
        u64::from(index),
    )
}

// Fill the whole window with replies at `latency`
fn warm(path: &mut Path, latency: Duration) {
    for _ in 0..WINDOW {
        path.record(latency, false);
    }
}

// Fill the whole window with unanswered rounds
fn black_hole(path: &mut Path) {
    for _ in 0..WINDOW {
        path.record(Duration::ZERO, true);
    }
}

/// Index 0 is the public path; latencies [20, 500, 300, 35] ms.
fn scenario() -> (Vec<ConnectionId>, BTreeMap<ConnectionId, Path>) {
    let names = [ConnectionId::PUBLIC, "sdn-1", "sdn-2", "sdn-3"];
    let latencies = [20, 500, 300, 35];

    let mut paths = BTreeMap::new();
    let mut ids = Vec::new();
    for (i, (name, latency)) in names.iter().zip(latencies).enumerate() {
        let mut path = new_path(name, i as u8);
        warm(&mut path, ms(latency));
        ids.push(path.connection().clone());
        paths.insert(path.connection().clone(), path);
    }
    (ids, paths)
}

fn selector(strategy: SelectionStrategy) -> PathSelector {
    PathSelector::new(SelectorConfig {
        strategy,
        window_size: WINDOW,
        ..Default::default()
    })
}

#[test]
fn test_lowest_latency_picks_fastest() {
    let (ids, paths) = scenario();
    let mut selector = selector(SelectionStrategy::LowestLatency);

    let route = selector.best_path(&paths);
    assert_eq!(route.connection.as_ref(), Some(&ids[0]));
    assert_eq!(route.address, Some(IpAddr::from([10, 0, 0, 1])));
    assert_eq!(route.reason, ChangeReason::NewRoute);
}

#[test]
fn test_prefer_direct_picks_public() {
    let (ids, paths) = scenario();
    let mut selector = selector(SelectionStrategy::PreferDirect);

    let route = selector.best_path(&paths);
    assert_eq!(route.connection.as_ref(), Some(&ids[0]));
    assert!(ids[0].is_public());
}

#[test]
fn test_lossy_public_flips_both_strategies() {
    for strategy in [SelectionStrategy::LowestLatency, SelectionStrategy::PreferDirect] {
        let (ids, mut paths) = scenario();
        let mut selector = selector(strategy);
        assert_eq!(selector.best_path(&paths).connection.as_ref(), Some(&ids[0]));

        black_hole(paths.get_mut(&ids[0]).unwrap());

        let route = selector.best_path(&paths);
        assert_eq!(route.connection.as_ref(), Some(&ids[3]), "strategy {strategy}");
        assert!(matches!(route.reason, ChangeReason::LossImproved { old, new } if old == 1.0 && new == 0.0));
    }
}

#[test]
fn test_selection_is_stable() {
    let (ids, paths) = scenario();
    let mut selector = selector(SelectionStrategy::LowestLatency);

    selector.best_path(&paths);
    for _ in 0..20 {
        let route = selector.best_path(&paths);
        assert_eq!(route.connection.as_ref(), Some(&ids[0]));
        assert_eq!(route.reason, ChangeReason::NoChange);
    }
}

#[test]
fn test_marginal_improvement_does_not_flap() {
    let mut paths = BTreeMap::new();
    let mut a = new_path("a", 1);
    let mut b = new_path("b", 2);
    warm(&mut a, ms(40));
    warm(&mut b, ms(45));
    paths.insert(a.connection().clone(), a);
    paths.insert(b.connection().clone(), b);

    let mut selector = selector(SelectionStrategy::LowestLatency);
    assert_eq!(selector.best_path(&paths).connection, Some(ConnectionId::new("a")));

    // b gets a little faster than a, but not by the reroute ratio.
    let b = paths.get_mut(&ConnectionId::new("b")).unwrap();
    warm(b, ms(36));
    for _ in 0..5 {
        let route = selector.best_path(&paths);
        assert_eq!(route.connection, Some(ConnectionId::new("a")));
    }

    // Now clearly faster: ratio 2.0, diff 20ms.
    let b = paths.get_mut(&ConnectionId::new("b")).unwrap();
    warm(b, ms(20));
    let route = selector.best_path(&paths);
    assert_eq!(route.connection, Some(ConnectionId::new("b")));
    assert_eq!(route.reason, ChangeReason::LatencyImproved { old: ms(40), new: ms(20) });
}

#[test]
fn test_loss_dominates_latency() {
    let mut fast = new_path("fast", 1);
    let mut slow = new_path("slow", 2);
    for i in 0..WINDOW {
        fast.record(if i == 0 { Duration::ZERO } else { ms(5) }, i == 0);
    }
    warm(&mut slow, ms(200));

    let mut paths = BTreeMap::new();
    paths.insert(fast.connection().clone(), fast);
    paths.insert(slow.connection().clone(), slow);

    // Even with hysteresis thresholds no latency gain could ever clear.
    let mut selector = PathSelector::new(SelectorConfig {
        reroute_ratio: 1000.0,
        reroute_diff: Duration::from_secs(60),
        ..Default::default()
    });
    let route = selector.best_path(&paths);
    assert_eq!(route.connection, Some(ConnectionId::new("slow")));
}

#[test]
fn test_incomplete_window_still_switches_on_loss() {
    let mut old = new_path("old", 1);
    warm(&mut old, ms(10));
    let mut paths = BTreeMap::new();
    paths.insert(old.connection().clone(), old);

    let mut selector = selector(SelectionStrategy::LowestLatency);
    selector.best_path(&paths);

    let mut fresh = new_path("young", 2);
    fresh.record(ms(90), false);
    assert!(fresh.incomplete());
    paths.insert(fresh.connection().clone(), fresh);

    let old = paths.get_mut(&ConnectionId::new("old")).unwrap();
    old.record(Duration::ZERO, true);

    let route = selector.best_path(&paths);
    assert_eq!(route.connection, Some(ConnectionId::new("young")));
    assert!(matches!(route.reason, ChangeReason::LossImproved { .. }));
}

#[test]
fn test_loss_threshold_deletes_route() {
    let mut only = new_path("only", 1);
    for i in 0..WINDOW {
        let lost = i % 2 == 0;
        only.record(if lost { Duration::ZERO } else { ms(15) }, lost);
    }
    assert!((only.loss() - 0.5).abs() < f64::EPSILON);

    let mut paths = BTreeMap::new();
    paths.insert(only.connection().clone(), only);

    let mut selector = PathSelector::new(SelectorConfig {
        route_delete_loss_threshold: 50,
        ..Default::default()
    });
    let route = selector.best_path(&paths);
    assert!(route.is_delete());
    assert_eq!(route.connection, None);
    assert!(matches!(route.reason, ChangeReason::RouteDeleted { loss: Some(l) } if l >= 0.5));
}

#[test]
fn test_loss_exactly_at_threshold_deletes_route() {
    // 29 / 100 does not survive a float multiplication by 100 exactly.
    let mut only = Path::new(
        PathConfig::new("only", "if1", IpAddr::from([10, 0, 0, 1])),
        GroupId::new("group-1"),
        100,
        1,
    );
    for i in 0..100 {
        let lost = i < 29;
        only.record(if lost { Duration::ZERO } else { ms(15) }, lost);
    }

    let mut paths = BTreeMap::new();
    paths.insert(only.connection().clone(), only);

    let mut at = PathSelector::new(SelectorConfig {
        window_size: 100,
        route_delete_loss_threshold: 29,
        ..Default::default()
    });
    assert!(at.best_path(&paths).is_delete());

    let mut above = PathSelector::new(SelectorConfig {
        window_size: 100,
        route_delete_loss_threshold: 30,
        ..Default::default()
    });
    assert!(!above.best_path(&paths).is_delete());
}

#[test]
fn test_zero_threshold_keeps_dead_paths() {
    let (ids, mut paths) = scenario();
    for path in paths.values_mut() {
        black_hole(path);
    }

    let mut selector = selector(SelectionStrategy::LowestLatency);
    let route = selector.best_path(&paths);
    assert!(!route.is_delete());
    // All tied at 100% loss with no latency: first in key order wins.
    assert_eq!(route.connection.as_ref(), Some(&ids[0]));
}

#[test]
fn test_unprobed_group_has_no_route() {
    let mut paths = BTreeMap::new();
    let path = new_path("a", 1);
    paths.insert(path.connection().clone(), path);

    let mut selector = selector(SelectionStrategy::LowestLatency);
    let route = selector.best_path(&paths);
    assert_eq!(route.reason, ChangeReason::RouteDeleted { loss: None });
}

#[test]
fn test_prefer_direct_leaves_public_only_past_thresholds() {
    let mut public = new_path(ConnectionId::PUBLIC, 0);
    let mut overlay = new_path("sdn-1", 1);
    warm(&mut public, ms(100));
    warm(&mut overlay, ms(90));

    let mut paths = BTreeMap::new();
    paths.insert(public.connection().clone(), public);
    paths.insert(overlay.connection().clone(), overlay);

    let mut selector = selector(SelectionStrategy::PreferDirect);
    assert_eq!(selector.best_path(&paths).connection, Some(ConnectionId::public()));

    warm(paths.get_mut(&ConnectionId::new("sdn-1")).unwrap(), ms(30));
    let route = selector.best_path(&paths);
    assert_eq!(route.connection, Some(ConnectionId::new("sdn-1")));

    // Public recovers: prefer-direct measures against public, not the
    // current choice, and public is no longer beaten.
    warm(paths.get_mut(&ConnectionId::new("sdn-1")).unwrap(), ms(95));
    let route = selector.best_path(&paths);
    assert_eq!(route.connection, Some(ConnectionId::public()));
}
