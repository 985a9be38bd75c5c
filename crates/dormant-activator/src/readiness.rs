//! Readiness probing after a scale-up.
//!
//! A resource counts as ready once its HTTP endpoint answers with anything
//! other than a server error. Connection failures mean the replica is not
//! up yet.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use tracing::debug;

use dormant_core::client;
use dormant_core::{BoxFuture, ScalerConfig};

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The resource answered.
    Ready,
    /// The resource answered with a 5xx.
    NotReady,
    /// The probe could not reach the resource.
    Failed,
}

/// Decides whether a freshly scaled resource can take traffic.
pub trait ReadinessProbe: Send + Sync {
    fn probe<'a>(&'a self, namespace: &'a str, resource: &'a str) -> BoxFuture<'a, ProbeResult>;
}

/// Probes `GET {path}` on `{resource}:{port}`.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    port: u16,
    path: String,
    timeout: Duration,
}

impl HttpReadinessProbe {
    pub fn new(port: u16, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            port,
            path: path.into(),
            timeout,
        }
    }

    /// Probe the target port and readiness path from `config`.
    ///
    /// A single probe never outlives one polling interval.
    pub fn from_config(config: &ScalerConfig) -> Self {
        Self::new(
            config.target_port,
            config.readiness_path.clone(),
            config.readiness_interval.max(Duration::from_millis(100)),
        )
    }
}

impl ReadinessProbe for HttpReadinessProbe {
    fn probe<'a>(&'a self, _namespace: &'a str, resource: &'a str) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            let authority = format!("{resource}:{}", self.port);
            let req = match http::Request::builder()
                .method("GET")
                .uri(&self.path)
                .header("host", &authority)
                .header("user-agent", "dormant-readiness/0.1")
                .body(Full::new(Bytes::new()))
            {
                Ok(req) => req,
                Err(e) => {
                    debug!(error = %e, %authority, "cannot build readiness request");
                    return ProbeResult::Failed;
                }
            };

            match client::send(&authority, req, self.timeout).await {
                Ok(resp) if resp.status().is_server_error() => {
                    debug!(%authority, status = %resp.status(), "resource not ready");
                    ProbeResult::NotReady
                }
                Ok(_) => ProbeResult::Ready,
                Err(e) => {
                    debug!(%authority, error = %e, "readiness probe failed");
                    ProbeResult::Failed
                }
            }
        })
    }
}
