//! dormant-core — shared model for the dormant scale-to-zero controller.
//!
//! Everything the activator, the autoscaler and the gateway agree on lives
//! here: the per-resource activation states, metric samples, the immutable
//! [`ScalerConfig`], the error taxonomy, and the two pluggable contracts the
//! rest of the system is written against.
//!
//! # Architecture
//!
//! ```text
//! request path:   Gateway ──▶ Coordinator ──▶ ResourceScaler::set_scale(1)
//! timer path:     Poller  ──▶ DecisionLoop ──▶ ResourceScaler::set_scale(0)
//!                   │
//!                   └──▶ MetricSource::fetch
//! ```
//!
//! Backends are selected at configuration time through [`BackendKind`];
//! the in-memory backend doubles as the fake used by every test suite.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use backend::{BackendKind, BackendSelection, BoxFuture, ResourceScaler, build_backend};
pub use config::{BackendConfig, ConfigFile, ConfigLayer, ScalerConfig};
pub use error::{ScalerError, ScalerResult};
pub use metrics::MetricSource;
pub use types::*;
