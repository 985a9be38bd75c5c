//! dormant-autoscale — detects sustained idleness and scales to zero.
//!
//! Two independent periodic tasks connected by a channel:
//!
//! ```text
//! MetricPoller (metrics_interval)
//!     get_resources ──▶ PollEvent::Known(ids)
//!     for id: MetricSource::fetch ──▶ PollEvent::Sample(id, v, t)
//!                         │
//!                         ▼
//! DecisionLoop
//!     on sample:  v >  threshold  → clear idle window
//!                 v <= threshold  → start window (if none);
//!                                   eligible once t - start >= scale_window
//!     on tick (scale_interval):
//!                 eligible && Active → set_scale(id, 0), mark_inactive(id)
//! ```
//!
//! A resource with no samples is never scaled down, and resources that are
//! mid-activation are skipped until the attempt resolves.

pub mod decision;
pub mod poller;

pub use decision::DecisionLoop;
pub use poller::{MetricPoller, PollEvent};
