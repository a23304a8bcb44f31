//! # pathsteer
//!
//! Dynamic path selection for hosts reachable over several redundant paths:
//! one direct (public) path plus any number of overlay tunnels.
//!
//! pathsteer probes every path with ICMP, keeps a moving-average window of
//! latency and loss per path, selects the best path per connection group
//! with hysteresis against flapping, and reconciles the OS route table with
//! the selection.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Agent (probe + apply loops)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                Router / Reconciler (bounded apply)              │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │ Group A  │  │ Group B  │  │ Group C  │  │ Group N  │         │
//! │  │ selector │  │ selector │  │ selector │  │   ...    │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Per-path sample windows (latency, loss)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │           ICMP prober (raw or datagram, IPv4 and IPv6)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Route adapter (ip route / route -n)             │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_truncation)]  // Checksum folding
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::significant_drop_tightening)] // Router lock spans the whole apply
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::future_not_send)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::neg_cmp_op_on_partial_ord)] // NaN must fail validation

pub mod agent;
pub mod config;
pub mod error;
pub mod metrics;
pub mod multipath;
pub mod probe;
pub mod routing;
pub mod types;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{PathQuality, SampleWindow};
    pub use crate::multipath::{Path, PathConfig, PathSelector, RouteGroup, SelectionStrategy, SelectorConfig};
    pub use crate::probe::{ProbeConfig, ProbeMode, ProbeStats, Prober};
    pub use crate::routing::{ApplyReport, RouteAdapter, Router, RouterEvent, SystemRouteAdapter};
    pub use crate::types::*;
}
