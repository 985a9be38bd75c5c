//! Metric poller — samples every known resource on a fixed interval.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use dormant_core::{MetricSample, MetricSource, ResourceScaler, ScalerConfig};

/// What the poller tells the decision loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Every resource the backend enumerated this cycle.
    Known(HashSet<String>),
    Sample(MetricSample),
}

pub struct MetricPoller {
    namespace: String,
    metric_name: String,
    interval: Duration,
    backend: Arc<dyn ResourceScaler>,
    source: Arc<dyn MetricSource>,
    tx: mpsc::Sender<PollEvent>,
}

impl MetricPoller {
    pub fn new(
        config: &ScalerConfig,
        backend: Arc<dyn ResourceScaler>,
        source: Arc<dyn MetricSource>,
        tx: mpsc::Sender<PollEvent>,
    ) -> Self {
        Self {
            namespace: config.namespace.clone(),
            metric_name: config.metric_name.clone(),
            interval: config.metrics_interval,
            backend,
            source,
            tx,
        }
    }

    /// Run one polling cycle.
    ///
    /// Returns the number of samples forwarded, or `None` once the decision
    /// loop has gone away.
    pub async fn poll_once(&self) -> Option<usize> {
        let resources = match self.backend.get_resources(&self.namespace).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "resource enumeration failed, skipping cycle"
                );
                return Some(0);
            }
        };

        let known: HashSet<String> = resources.iter().cloned().collect();
        self.source.retain(&known);
        self.tx.send(PollEvent::Known(known)).await.ok()?;

        let mut sent = 0;
        for resource in &resources {
            let value = match self
                .source
                .fetch(&self.namespace, resource, &self.metric_name)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    warn!(%resource, metric = %self.metric_name, error = %e, "metric fetch failed");
                    continue;
                }
            };

            let sample = MetricSample::new(resource.clone(), value, Instant::now());
            self.tx.send(PollEvent::Sample(sample)).await.ok()?;
            sent += 1;
        }

        debug!(resources = resources.len(), samples = sent, "poll cycle complete");
        Some(sent)
    }

    /// Poll until `shutdown` fires or the decision loop stops listening.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            metric = %self.metric_name,
            "metric poller started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.poll_once().await.is_none() {
                        info!("sample receiver closed, metric poller stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("metric poller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use dormant_core::backend::MemoryScaler;
    use dormant_core::{BoxFuture, ScalerError, ScalerResult};

    struct FixedSource {
        values: HashMap<&'static str, f64>,
        retained: std::sync::Mutex<Option<HashSet<String>>>,
    }

    impl MetricSource for FixedSource {
        fn fetch<'a>(
            &'a self,
            _namespace: &'a str,
            resource: &'a str,
            _metric: &'a str,
        ) -> BoxFuture<'a, ScalerResult<f64>> {
            Box::pin(async move {
                self.values
                    .get(resource)
                    .copied()
                    .ok_or_else(|| ScalerError::metric(resource, "no data"))
            })
        }

        fn retain(&self, known: &HashSet<String>) {
            *self.retained.lock().unwrap() = Some(known.clone());
        }
    }

    fn setup(resources: &[&str]) -> (Arc<MemoryScaler>, Arc<FixedSource>) {
        let backend = MemoryScaler::new("default");
        for r in resources {
            backend.insert(r, 1).unwrap();
        }
        let source = FixedSource {
            values: HashMap::from([("svc-a", 5.0), ("svc-b", 12.0)]),
            retained: std::sync::Mutex::new(None),
        };
        (Arc::new(backend), Arc::new(source))
    }

    fn drain(rx: &mut mpsc::Receiver<PollEvent>) -> Vec<PollEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn poll_once_samples_every_resource() {
        let (backend, source) = setup(&["svc-a", "svc-b"]);
        let (tx, mut rx) = mpsc::channel(16);
        let poller = MetricPoller::new(&ScalerConfig::default(), backend, source, tx);

        assert_eq!(poller.poll_once().await, Some(2));

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            PollEvent::Known(HashSet::from(["svc-a".to_string(), "svc-b".to_string()]))
        );
        let mut samples: Vec<(String, f64)> = events[1..]
            .iter()
            .map(|e| match e {
                PollEvent::Sample(s) => (s.resource.clone(), s.value),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        samples.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(samples, vec![("svc-a".into(), 5.0), ("svc-b".into(), 12.0)]);
    }

    #[tokio::test]
    async fn fetch_failure_skips_only_that_resource() {
        let (backend, source) = setup(&["svc-a", "svc-c"]);
        let (tx, mut rx) = mpsc::channel(16);
        let poller = MetricPoller::new(&ScalerConfig::default(), backend, source, tx);

        assert_eq!(poller.poll_once().await, Some(1));

        let samples: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PollEvent::Sample(s) => Some(s.resource),
                PollEvent::Known(_) => None,
            })
            .collect();
        assert_eq!(samples, vec!["svc-a"]);
    }

    #[tokio::test]
    async fn enumeration_failure_skips_cycle() {
        let (backend, source) = setup(&["svc-a"]);
        backend.set_list_failing(true);
        let (tx, mut rx) = mpsc::channel(16);
        let poller = MetricPoller::new(&ScalerConfig::default(), backend.clone(), source, tx);

        assert_eq!(poller.poll_once().await, Some(0));
        assert!(drain(&mut rx).is_empty());

        backend.set_list_failing(false);
        assert_eq!(poller.poll_once().await, Some(1));
    }

    #[tokio::test]
    async fn enumeration_is_passed_to_source() {
        let (backend, source) = setup(&["svc-a", "svc-b"]);
        let (tx, _rx) = mpsc::channel(16);
        let poller = MetricPoller::new(&ScalerConfig::default(), backend.clone(), source.clone(), tx);

        poller.poll_once().await;
        backend.remove("svc-b");
        poller.poll_once().await;

        let retained = source.retained.lock().unwrap().clone();
        assert_eq!(retained, Some(HashSet::from(["svc-a".to_string()])));
    }

    #[tokio::test]
    async fn closed_receiver_stops_polling() {
        let (backend, source) = setup(&["svc-a"]);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let poller = MetricPoller::new(&ScalerConfig::default(), backend, source, tx);
        assert_eq!(poller.poll_once().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_each_interval_until_shutdown() {
        let (backend, source) = setup(&["svc-a"]);
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = ScalerConfig {
            metrics_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let poller = MetricPoller::new(&config, backend, source, tx);

        let handle = tokio::spawn(async move { poller.run(stop_rx).await });

        // Ticks at 0s, 10s, 20s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let samples = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PollEvent::Sample(_)))
            .count();
        assert_eq!(samples, 3);
    }
}
