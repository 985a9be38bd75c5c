//! Subsystem wiring and lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info};

use dormant_activator::{Coordinator, HttpReadinessProbe};
use dormant_autoscale::{DecisionLoop, MetricPoller};
use dormant_core::{ActivationState, ResourceScaler, ScalerConfig};
use dormant_gateway::{Gateway, GatewayServer, RequestTracker};

/// Poller → decision loop buffer. One cycle emits one event per resource
/// plus one; a slow decision loop applies back-pressure to the poller.
const EVENT_BUFFER: usize = 1024;

/// Run every subsystem until Ctrl-C.
pub async fn run(config: ScalerConfig, backend: Arc<dyn ResourceScaler>) -> anyhow::Result<()> {
    info!(namespace = %config.namespace, "dormant daemon starting");

    // ── Request path ───────────────────────────────────────────

    let probe = Arc::new(HttpReadinessProbe::from_config(&config));
    let coordinator = Coordinator::new(&config, backend.clone(), probe);
    let tracker = Arc::new(RequestTracker::new());
    let gateway = Arc::new(Gateway::new(&config, coordinator.clone(), tracker.clone()));
    let server = GatewayServer::bind(config.listen_address, gateway).await?;

    // ── Timer path ─────────────────────────────────────────────

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let poller = MetricPoller::new(&config, backend.clone(), tracker, events_tx);
    let mut decisions = DecisionLoop::new(&config, backend, coordinator.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller_shutdown = shutdown_rx.clone();
    let poller_handle = tokio::spawn(async move {
        poller.run(poller_shutdown).await;
    });

    let decisions_shutdown = shutdown_rx.clone();
    let decisions_handle = tokio::spawn(async move {
        decisions.run(events_rx, decisions_shutdown).await;
    });

    let server_handle = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle.await.context("gateway task panicked")??;
    log_task_exit("metric poller", poller_handle.await);
    log_task_exit("scale-down loop", decisions_handle.await);

    let resources = coordinator.resources();
    let active = resources
        .iter()
        .filter(|r| r.state == ActivationState::Active)
        .count();
    info!(known = resources.len(), active, "dormant daemon stopped");
    Ok(())
}

/// Log how a background task ended. Returns `false` if it panicked or was
/// cancelled.
fn log_task_exit(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => {
            debug!(task, "task stopped");
            true
        }
        Err(e) => {
            error!(task, error = %e, "task ended abnormally");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_exit_is_reported_ok() {
        let handle = tokio::spawn(async {});
        assert!(log_task_exit("poller", handle.await));
    }

    #[tokio::test]
    async fn panicked_task_is_reported() {
        let handle = tokio::spawn(async {
            panic!("poller crashed");
        });
        assert!(!log_task_exit("poller", handle.await));
    }
}
