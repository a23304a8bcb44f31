//! Route table reconciliation.
//!
//! The [`Router`] owns every route group, records add/delete intent as
//! pending flags and reconciles it with the OS route table through a
//! [`RouteAdapter`] when [`Router::apply`] runs.

mod adapter;
mod router;
mod status;

pub use adapter::{RouteAdapter, SystemRouteAdapter};
pub use router::{Router, RouterConfig, MAX_APPLY_ITERATIONS};
pub use status::{ApplyReport, PathChangeEvent, RouteStatus, RouterEvent};
