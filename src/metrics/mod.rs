//! Per-path moving-average statistics.
//!
//! Every path keeps a [`SampleWindow`] of the last W probe rounds. Latency
//! and loss are averaged differently: latency only counts rounds
//! that got a reply, loss counts every slot, so a single bad round lingers
//! in the loss figure for the whole window.

mod quality;
mod window;

pub use quality::PathQuality;
pub use window::SampleWindow;

/// Default number of rounds kept per path.
pub const DEFAULT_WINDOW_SIZE: usize = 10;
