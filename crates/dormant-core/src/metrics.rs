//! Metric source contract.
//!
//! The poller does not know where metric values come from; the daemon
//! plugs in whatever the environment offers. The gateway's request tracker
//! is the built-in source.

use std::collections::HashSet;

use crate::backend::BoxFuture;
use crate::error::ScalerResult;

/// Something that can report the current value of a named metric.
pub trait MetricSource: Send + Sync {
    /// Sample `metric` for `resource` in `namespace`.
    ///
    /// Errors are reported as [`ScalerError::MetricFetch`](crate::ScalerError::MetricFetch)
    /// and only skip that resource for the current cycle.
    fn fetch<'a>(
        &'a self,
        namespace: &'a str,
        resource: &'a str,
        metric: &'a str,
    ) -> BoxFuture<'a, ScalerResult<f64>>;

    /// Drop any per-resource state held for resources outside `known`.
    ///
    /// Called with every successful enumeration. Stateless sources keep the
    /// default no-op.
    fn retain(&self, _known: &HashSet<String>) {}
}
