//! Scale-down decision loop.
//!
//! Owns one idle window per resource. Samples only move windows forward;
//! the periodic tick is the only place scale-down commands are issued.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use dormant_activator::Coordinator;
use dormant_core::{ActivationState, MetricSample, ResourceScaler, ScalerConfig};

use crate::poller::PollEvent;

/// Contiguous span during which a resource's metric stayed at or below the
/// threshold.
#[derive(Debug, Clone, Copy)]
struct IdleWindow {
    start: Instant,
    eligible: bool,
}

#[derive(Debug, Default)]
struct Tracked {
    /// Newest sample timestamp accepted so far.
    last_sample: Option<Instant>,
    idle: Option<IdleWindow>,
}

pub struct DecisionLoop {
    namespace: String,
    threshold: f64,
    window: Duration,
    interval: Duration,
    backend: Arc<dyn ResourceScaler>,
    coordinator: Coordinator,
    tracked: HashMap<String, Tracked>,
}

impl DecisionLoop {
    pub fn new(
        config: &ScalerConfig,
        backend: Arc<dyn ResourceScaler>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            namespace: config.namespace.clone(),
            threshold: config.scale_threshold,
            window: config.scale_window,
            interval: config.scale_interval,
            backend,
            coordinator,
            tracked: HashMap::new(),
        }
    }

    /// Fold one sample into the resource's idle window.
    pub fn observe(&mut self, sample: &MetricSample) {
        let tracked = self.tracked.entry(sample.resource.clone()).or_default();

        if let Some(last) = tracked.last_sample
            && sample.timestamp < last
        {
            debug!(resource = %sample.resource, "discarding out-of-order sample");
            return;
        }
        tracked.last_sample = Some(sample.timestamp);

        // Already at zero: idleness only counts while replicas are up.
        if self.coordinator.state(&sample.resource) == ActivationState::Inactive {
            tracked.idle = None;
            return;
        }

        if sample.value > self.threshold {
            if tracked.idle.take().is_some() {
                debug!(
                    resource = %sample.resource,
                    value = sample.value,
                    "activity resets idle window"
                );
            }
            return;
        }

        let window = tracked.idle.get_or_insert(IdleWindow {
            start: sample.timestamp,
            eligible: false,
        });
        if !window.eligible && sample.timestamp.duration_since(window.start) >= self.window {
            window.eligible = true;
            debug!(resource = %sample.resource, "resource is idle-eligible");
        }
    }

    /// Forget resources the backend no longer enumerates, here and in the
    /// coordinator's activation table.
    pub fn retain_known(&mut self, known: &HashSet<String>) {
        self.tracked.retain(|id, _| known.contains(id));
        self.coordinator.retain_known(known);
    }

    pub fn is_eligible(&self, resource: &str) -> bool {
        self.tracked
            .get(resource)
            .and_then(|t| t.idle)
            .is_some_and(|w| w.eligible)
    }

    /// Scale down every idle-eligible resource that is currently `Active`.
    ///
    /// Returns the resources that were scaled down.
    pub async fn tick(&mut self) -> Vec<String> {
        let mut eligible: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.idle.is_some_and(|w| w.eligible))
            .map(|(id, _)| id.clone())
            .collect();
        eligible.sort();

        let mut scaled = Vec::new();
        for resource in eligible {
            let state = self.coordinator.state(&resource);
            if state != ActivationState::Active {
                debug!(%resource, %state, "idle but not active, skipping");
                continue;
            }

            match self.backend.set_scale(&self.namespace, &resource, 0).await {
                Ok(()) => {
                    info!(%resource, "scaled to zero after idle window");
                    if let Some(t) = self.tracked.get_mut(&resource) {
                        t.idle = None;
                    }
                    self.coordinator.mark_inactive(&resource);
                    scaled.push(resource);
                }
                Err(e) => {
                    warn!(%resource, error = %e, "scale-down failed, retrying next interval");
                }
            }
        }
        scaled
    }

    /// Consume poller events and tick every `scale_interval` until shutdown.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<PollEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            window_ms = self.window.as_millis() as u64,
            threshold = self.threshold,
            "scale-down loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = events.recv() => match event {
                    PollEvent::Known(known) => self.retain_known(&known),
                    PollEvent::Sample(sample) => self.observe(&sample),
                },
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("scale-down loop shutting down");
                    break;
                }
            }
        }
    }
}
