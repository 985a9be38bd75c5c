//! dormant-activator — brings scaled-to-zero resources back on demand.
//!
//! # Architecture
//!
//! ```text
//! Coordinator::ensure_active(id, deadline)
//!   ├── Active       → return immediately
//!   ├── Activating   → attach to the in-flight attempt (watch channel)
//!   └── Inactive/Error
//!         └── spawn attempt task
//!               ├── ResourceScaler::set_scale(id, 1)   (never cancelled)
//!               ├── ReadinessProbe::probe() every readiness_interval
//!               └── publish outcome to every attached waiter
//! ```
//!
//! At most one scale-up is in flight per resource. Each caller waits only
//! until its own deadline; giving up releases that caller alone.

pub mod coordinator;
pub mod readiness;

pub use coordinator::{ActivationError, Coordinator};
pub use readiness::{HttpReadinessProbe, ProbeResult, ReadinessProbe};
