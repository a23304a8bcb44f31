//! Multi-path model and best-path selection.
//!
//! This module implements the per-group view of the world:
//! - Paths to a peer, one per connection, each with its probe window
//! - Service routes reachable through one or more of those paths
//! - The selector deciding which path a group should use

mod group;
mod path;
mod selector;

pub use group::{ActiveRoute, GroupStatus, PathStatus, RouteGroup, ServiceAction, ServiceRoute};
pub use path::{host_prefix, normalize_addr, normalize_prefix, Path, PathConfig};
pub use selector::{momentary_best, PathSelector, SelectionStrategy, SelectorConfig};
