//! Activation coordinator — single-flight scale-up per resource.
//!
//! The coordinator is the only writer of [`ActivationState`]. Each resource
//! has a slot in a sharded map; a slot in `Activating` carries the receiving
//! half of a `watch` channel on which the attempt task publishes exactly one
//! outcome. Callers that arrive mid-attempt clone that receiver instead of
//! starting a new scale-up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use dormant_core::{ActivationState, Resource, ResourceScaler, ScalerConfig};

use crate::readiness::{ProbeResult, ReadinessProbe};

/// Why a caller could not be handed an active resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    /// `set_scale` failed; shared by every waiter of the attempt.
    #[error("backend error: {0}")]
    Backend(String),

    /// The resource never reported ready within the activation timeout.
    #[error("resource did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// This caller's own deadline passed while waiting.
    #[error("activation deadline elapsed")]
    DeadlineElapsed,
}

impl ActivationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout(_) | Self::DeadlineElapsed)
    }
}

type Outcome = Result<(), ActivationError>;

#[derive(Default)]
struct Slot {
    state: ActivationState,
    /// Present only while `state == Activating`.
    inflight: Option<watch::Receiver<Option<Outcome>>>,
}

struct Inner {
    namespace: String,
    backend: Arc<dyn ResourceScaler>,
    probe: Arc<dyn ReadinessProbe>,
    activation_timeout: Duration,
    readiness_interval: Duration,
    slots: DashMap<String, Slot>,
}

/// Guarantees a resource is active before a request is proxied to it.
///
/// Cheap to clone; clones share the same state table.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        config: &ScalerConfig,
        backend: Arc<dyn ResourceScaler>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace: config.namespace.clone(),
                backend,
                probe,
                activation_timeout: config.activation_timeout,
                readiness_interval: config.readiness_interval,
                slots: DashMap::new(),
            }),
        }
    }

    /// Current state of `resource`; never-seen resources are `Inactive`.
    pub fn state(&self, resource: &str) -> ActivationState {
        self.inner
            .slots
            .get(resource)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Snapshot of every resource the coordinator has seen.
    pub fn resources(&self) -> Vec<Resource> {
        self.inner
            .slots
            .iter()
            .map(|entry| Resource {
                id: entry.key().clone(),
                namespace: self.inner.namespace.clone(),
                state: entry.state,
            })
            .collect()
    }

    /// Forget settled resources the backend no longer enumerates.
    ///
    /// `Inactive` and `Error` slots outside `known` are dropped; anything
    /// active or mid-activation keeps its slot. Returns how many were
    /// removed.
    pub fn retain_known(&self, known: &HashSet<String>) -> usize {
        let mut removed = 0;
        self.inner.slots.retain(|id, slot| {
            let keep = known.contains(id)
                || matches!(slot.state, ActivationState::Active | ActivationState::Activating);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, "pruned unknown resources from activation table");
        }
        removed
    }

    /// Record a completed scale-down. Only `Active` resources move to
    /// `Inactive`; anything mid-activation or failed is left alone.
    pub fn mark_inactive(&self, resource: &str) -> bool {
        match self.inner.slots.get_mut(resource) {
            Some(mut slot) if slot.state == ActivationState::Active => {
                slot.state = ActivationState::Inactive;
                debug!(%resource, "marked inactive");
                true
            }
            _ => false,
        }
    }

    /// Make sure `resource` is active, waiting no later than `deadline`.
    ///
    /// Concurrent calls for the same resource share one scale-up attempt.
    /// Giving up at `deadline` does not cancel the attempt; its outcome is
    /// still recorded for later callers.
    pub async fn ensure_active(
        &self,
        resource: &str,
        deadline: Instant,
    ) -> Result<(), ActivationError> {
        if self.state(resource) == ActivationState::Active {
            return Ok(());
        }

        let mut rx = match self.attach_or_start(resource) {
            Some(rx) => rx,
            None => return Ok(()),
        };

        match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => outcome.clone().unwrap_or_else(|| {
                Err(ActivationError::Backend("activation produced no outcome".into()))
            }),
            Ok(Err(_)) => Err(ActivationError::Backend("activation attempt aborted".into())),
            Err(_) => {
                debug!(%resource, "caller deadline elapsed while waiting for activation");
                Err(ActivationError::DeadlineElapsed)
            }
        }
    }

    /// Returns the receiver to wait on, or `None` if the resource is already
    /// active.
    fn attach_or_start(&self, resource: &str) -> Option<watch::Receiver<Option<Outcome>>> {
        let mut slot = self.inner.slots.entry(resource.to_string()).or_default();

        match slot.state {
            ActivationState::Active => return None,
            ActivationState::Activating => {
                // A closed channel means the attempt task is gone without
                // settling the slot; start over.
                if let Some(rx) = slot.inflight.as_ref().filter(|rx| rx.has_changed().is_ok()) {
                    debug!(%resource, "joining in-flight activation");
                    return Some(rx.clone());
                }
                warn!(%resource, "stale activation slot, restarting attempt");
            }
            ActivationState::Inactive | ActivationState::Error => {}
        }

        let (tx, rx) = watch::channel(None);
        slot.state = ActivationState::Activating;
        slot.inflight = Some(rx.clone());
        drop(slot);

        tokio::spawn(self.inner.clone().activate(resource.to_string(), tx));
        Some(rx)
    }
}

impl Inner {
    async fn activate(self: Arc<Self>, resource: String, tx: watch::Sender<Option<Outcome>>) {
        info!(%resource, "activating resource");
        let started = Instant::now();

        // The backend and probe run in their own task so that a panic in
        // either still settles the slot.
        let attempt = {
            let inner = self.clone();
            let resource = resource.clone();
            tokio::spawn(async move { inner.scale_up_and_wait(&resource, started).await })
        };
        let outcome = match attempt.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%resource, error = %e, "activation attempt aborted");
                Err(ActivationError::Backend(format!("activation attempt aborted: {e}")))
            }
        };
        let state = match &outcome {
            Ok(()) => {
                info!(%resource, elapsed_ms = started.elapsed().as_millis() as u64, "resource active");
                ActivationState::Active
            }
            Err(e) => {
                warn!(%resource, error = %e, "activation failed");
                ActivationState::Error
            }
        };

        // Publish the new state before releasing waiters so a caller woken
        // by the outcome never observes a stale `Activating` slot.
        if let Some(mut slot) = self.slots.get_mut(&resource) {
            slot.state = state;
            slot.inflight = None;
        }
        let _ = tx.send(Some(outcome));
    }

    async fn scale_up_and_wait(&self, resource: &str, started: Instant) -> Outcome {
        // Runs to completion regardless of caller deadlines.
        self.backend
            .set_scale(&self.namespace, resource, 1)
            .await
            .map_err(|e| ActivationError::Backend(e.to_string()))?;

        let budget_end = started + self.activation_timeout;
        loop {
            match self.probe.probe(&self.namespace, resource).await {
                ProbeResult::Ready => return Ok(()),
                other => debug!(%resource, result = ?other, "waiting for readiness"),
            }

            let next = Instant::now() + self.readiness_interval;
            if next >= budget_end {
                return Err(ActivationError::ReadinessTimeout(self.activation_timeout));
            }
            tokio::time::sleep_until(next).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use dormant_core::backend::MemoryScaler;
    use dormant_core::{BackendConfig, BoxFuture, ScalerResult};

    /// Panics on the first `set_scale`, then delegates.
    struct PanicOnce {
        inner: MemoryScaler,
        panicked: AtomicBool,
    }

    impl ResourceScaler for PanicOnce {
        fn set_scale<'a>(
            &'a self,
            namespace: &'a str,
            resource: &'a str,
            replicas: u32,
        ) -> BoxFuture<'a, ScalerResult<()>> {
            Box::pin(async move {
                if !self.panicked.swap(true, Ordering::SeqCst) {
                    panic!("backend crashed");
                }
                self.inner.set_scale(namespace, resource, replicas).await
            })
        }

        fn get_resources<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, ScalerResult<Vec<String>>> {
            self.inner.get_resources(namespace)
        }

        fn get_config(&self) -> BoxFuture<'_, ScalerResult<Option<BackendConfig>>> {
            self.inner.get_config()
        }
    }

    /// Becomes ready a fixed delay after the first probe.
    struct DelayedProbe {
        ready_after: Duration,
        first: std::sync::Mutex<Option<Instant>>,
    }

    impl DelayedProbe {
        fn new(ready_after: Duration) -> Arc<Self> {
            Arc::new(Self {
                ready_after,
                first: std::sync::Mutex::new(None),
            })
        }
    }

    impl ReadinessProbe for DelayedProbe {
        fn probe<'a>(&'a self, _ns: &'a str, _resource: &'a str) -> BoxFuture<'a, ProbeResult> {
            Box::pin(async move {
                let now = Instant::now();
                let first = *self.first.lock().unwrap().get_or_insert(now);
                if now.duration_since(first) >= self.ready_after {
                    ProbeResult::Ready
                } else {
                    ProbeResult::Failed
                }
            })
        }
    }

    fn config() -> ScalerConfig {
        ScalerConfig {
            activation_timeout: Duration::from_secs(10),
            readiness_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn backend(delay: Duration) -> Arc<MemoryScaler> {
        let scaler = MemoryScaler::new("default").with_scale_delay(delay);
        scaler.insert("svc-a", 0).unwrap();
        scaler.insert("svc-b", 0).unwrap();
        Arc::new(scaler)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test(start_paused = true)]
    async fn activates_inactive_resource() {
        let backend = backend(Duration::ZERO);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        assert_eq!(coordinator.state("svc-a"), ActivationState::Inactive);
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();

        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
        assert_eq!(backend.replicas("svc-a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn active_resource_takes_fast_path() {
        let backend = backend(Duration::ZERO);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();

        assert_eq!(backend.call_count("svc-a", 1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_scale_up() {
        let backend = backend(Duration::from_secs(1));
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move { c.ensure_active("svc-a", far_deadline()).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(()));
        }

        assert_eq!(backend.call_count("svc-a", 1), 1);
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let backend = backend(Duration::from_millis(200));
        backend.set_failing(true);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move { c.ensure_active("svc-a", far_deadline()).await }));
        }
        for h in handles {
            assert!(matches!(h.await.unwrap(), Err(ActivationError::Backend(_))));
        }

        assert_eq!(backend.call_count("svc-a", 1), 1);
        assert_eq!(coordinator.state("svc-a"), ActivationState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_retries_on_next_call() {
        let backend = backend(Duration::ZERO);
        backend.set_failing(true);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        assert!(coordinator.ensure_active("svc-a", far_deadline()).await.is_err());
        assert_eq!(coordinator.state("svc-a"), ActivationState::Error);

        backend.set_failing(false);
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
        assert_eq!(backend.call_count("svc-a", 1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_delay_adds_bounded_latency() {
        let backend = backend(Duration::ZERO);
        let coordinator = Coordinator::new(&config(), backend, DelayedProbe::new(Duration::from_secs(2)));

        let start = Instant::now();
        coordinator
            .ensure_active("svc-a", start + Duration::from_secs(10))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_moves_to_error() {
        let backend = backend(Duration::ZERO);
        let coordinator =
            Coordinator::new(&config(), backend, DelayedProbe::new(Duration::from_secs(3600)));

        let err = coordinator.ensure_active("svc-a", far_deadline()).await.unwrap_err();
        assert_eq!(err, ActivationError::ReadinessTimeout(Duration::from_secs(10)));
        assert!(err.is_timeout());
        assert_eq!(coordinator.state("svc-a"), ActivationState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn short_deadline_releases_only_that_caller() {
        let backend = backend(Duration::from_secs(3));
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let patient = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.ensure_active("svc-a", far_deadline()).await })
        };
        let hasty = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                c.ensure_active("svc-a", Instant::now() + Duration::from_secs(1)).await
            })
        };

        assert_eq!(hasty.await.unwrap(), Err(ActivationError::DeadlineElapsed));
        assert_eq!(patient.await.unwrap(), Ok(()));
        assert_eq!(backend.call_count("svc-a", 1), 1);
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_attempt_still_completes() {
        let backend = backend(Duration::from_secs(2));
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let err = coordinator
            .ensure_active("svc-a", Instant::now() + Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ActivationError::DeadlineElapsed);
        assert_eq!(coordinator.state("svc-a"), ActivationState::Activating);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
        assert_eq!(backend.replicas("svc-a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn resources_are_independent() {
        let backend = backend(Duration::ZERO);
        backend.set_failing(true);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        assert!(coordinator.ensure_active("svc-a", far_deadline()).await.is_err());
        backend.set_failing(false);
        coordinator.ensure_active("svc-b", far_deadline()).await.unwrap();

        assert_eq!(coordinator.state("svc-a"), ActivationState::Error);
        assert_eq!(coordinator.state("svc-b"), ActivationState::Active);
        assert_eq!(coordinator.resources().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_inactive_only_touches_active() {
        let backend = backend(Duration::ZERO);
        let coordinator = Coordinator::new(&config(), backend, DelayedProbe::new(Duration::ZERO));

        assert!(!coordinator.mark_inactive("svc-a"));
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        assert!(coordinator.mark_inactive("svc-a"));
        assert_eq!(coordinator.state("svc-a"), ActivationState::Inactive);
        assert!(!coordinator.mark_inactive("svc-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempt_settles_as_error_and_retries() {
        let scaler = MemoryScaler::new("default");
        scaler.insert("svc-a", 0).unwrap();
        let backend = Arc::new(PanicOnce {
            inner: scaler,
            panicked: AtomicBool::new(false),
        });
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let err = coordinator.ensure_active("svc-a", far_deadline()).await.unwrap_err();
        assert!(matches!(err, ActivationError::Backend(_)), "{err:?}");
        assert_eq!(coordinator.state("svc-a"), ActivationState::Error);

        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
        assert_eq!(backend.inner.replicas("svc-a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retain_known_drops_settled_unknown_resources() {
        let backend = backend(Duration::ZERO);
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        // Names the backend has never heard of end up in `Error`.
        for i in 0..50 {
            let name = format!("ghost-{i}");
            assert!(coordinator.ensure_active(&name, far_deadline()).await.is_err());
        }
        coordinator.ensure_active("svc-a", far_deadline()).await.unwrap();
        assert_eq!(coordinator.resources().len(), 51);

        let known = HashSet::from(["svc-a".to_string(), "svc-b".to_string()]);
        assert_eq!(coordinator.retain_known(&known), 50);

        let remaining: Vec<String> = coordinator.resources().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec!["svc-a"]);
        assert_eq!(coordinator.state("ghost-0"), ActivationState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn retain_known_keeps_in_flight_attempts() {
        let backend = backend(Duration::from_secs(2));
        let coordinator = Coordinator::new(&config(), backend.clone(), DelayedProbe::new(Duration::ZERO));

        let pending = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.ensure_active("svc-a", far_deadline()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.state("svc-a"), ActivationState::Activating);

        assert_eq!(coordinator.retain_known(&HashSet::new()), 0);
        assert_eq!(pending.await.unwrap(), Ok(()));
        assert_eq!(coordinator.state("svc-a"), ActivationState::Active);
    }
}
