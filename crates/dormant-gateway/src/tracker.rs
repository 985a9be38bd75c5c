//! Request tracker — per-resource request counts for the metric poller.
//!
//! The gateway records every request it routes. Each fetch reports the
//! count since the previous fetch and starts a new window.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use dormant_core::{BoxFuture, MetricSource, ScalerError, ScalerResult};

/// Requests counted since the last fetch.
pub const METRIC_REQUESTS: &str = "requests";
/// Requests per second since the last fetch.
pub const METRIC_RPS: &str = "rps";

struct Window {
    count: u64,
    since: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            count: 0,
            since: Instant::now(),
        }
    }
}

/// Counts routed requests per resource.
///
/// One gateway serves one namespace, so windows are keyed by resource id
/// alone.
#[derive(Default)]
pub struct RequestTracker {
    windows: DashMap<String, Window>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `resource`.
    pub fn record(&self, resource: &str) {
        self.windows
            .entry(resource.to_string())
            .or_insert_with(Window::new)
            .count += 1;
    }

    /// Requests recorded in the current window, without resetting it.
    pub fn pending(&self, resource: &str) -> u64 {
        self.windows.get(resource).map_or(0, |w| w.count)
    }

    /// Close the current window and return `(count, elapsed)`.
    fn take(&self, resource: &str) -> (u64, std::time::Duration) {
        let mut window = self
            .windows
            .entry(resource.to_string())
            .or_insert_with(Window::new);
        let now = Instant::now();
        let taken = (window.count, now.duration_since(window.since));
        window.count = 0;
        window.since = now;
        taken
    }
}

impl MetricSource for RequestTracker {
    fn fetch<'a>(
        &'a self,
        _namespace: &'a str,
        resource: &'a str,
        metric: &'a str,
    ) -> BoxFuture<'a, ScalerResult<f64>> {
        Box::pin(async move {
            let value = match metric {
                METRIC_REQUESTS => self.take(resource).0 as f64,
                METRIC_RPS => {
                    let (count, elapsed) = self.take(resource);
                    let secs = elapsed.as_secs_f64();
                    if secs > 0.0 { count as f64 / secs } else { 0.0 }
                }
                other => {
                    return Err(ScalerError::metric(
                        resource,
                        format!("unsupported metric {other:?}, expected {METRIC_REQUESTS:?} or {METRIC_RPS:?}"),
                    ));
                }
            };
            debug!(%resource, %metric, value, "request metric sampled");
            Ok(value)
        })
    }

    fn retain(&self, known: &HashSet<String>) {
        self.windows.retain(|id, _| known.contains(id));
    }
}
