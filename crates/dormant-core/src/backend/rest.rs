//! REST control-plane backend.
//!
//! Talks to an orchestration API over plain HTTP/1.1:
//!
//! | Method | Path | Body / Response |
//! |---|---|---|
//! | POST | `/api/v1/namespaces/{ns}/resources/{id}/scale` | `{"replicas": n}` |
//! | GET | `/api/v1/namespaces/{ns}/resources` | `["svc-a", ...]` |
//! | GET | `/api/v1/config` | `BackendConfig` JSON, or 404 for none |
//!
//! The control plane is expected to treat a scale request for the current
//! replica count as a successful no-op.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use tracing::{debug, warn};

use crate::backend::{BoxFuture, ResourceScaler};
use crate::client::{self, ClientError};
use crate::config::BackendConfig;
use crate::error::{ScalerError, ScalerResult};
use crate::types::validate_name;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(serde::Serialize)]
struct ScaleBody {
    replicas: u32,
}

/// Backend that forwards scale commands to a REST control plane.
#[derive(Debug, Clone)]
pub struct HttpScaler {
    authority: String,
    base_path: String,
    timeout: Duration,
}

impl HttpScaler {
    /// Build a scaler for `url` (`http://host:port[/prefix]`).
    pub fn new(url: &str) -> ScalerResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ScalerError::config(format!("backend url {url:?}: {e}")))?;

        if uri.scheme_str() != Some("http") {
            return Err(ScalerError::config(format!(
                "backend url {url:?} must use the http scheme"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ScalerError::config(format!("backend url {url:?} has no host")))?;
        let authority = if authority.port_u16().is_some() {
            authority.to_string()
        } else {
            format!("{}:80", authority.host())
        };

        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ScalerResult<(StatusCode, Bytes)> {
        let uri = format!("{}{path}", self.base_path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", &self.authority)
            .header("user-agent", "dormant/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ScalerError::backend(format!("building {method} {uri}: {e}")))?;

        let resp = client::send(&self.authority, req, self.timeout)
            .await
            .map_err(|e: ClientError| ScalerError::backend(format!("{method} {uri}: {e}")))?;
        debug!(%method, %uri, status = %resp.status(), "control plane responded");
        Ok((resp.status(), resp.into_body()))
    }
}

impl ResourceScaler for HttpScaler {
    fn set_scale<'a>(
        &'a self,
        namespace: &'a str,
        resource: &'a str,
        replicas: u32,
    ) -> BoxFuture<'a, ScalerResult<()>> {
        Box::pin(async move {
            validate_name("namespace", namespace)?;
            validate_name("resource", resource)?;

            let body = serde_json::to_vec(&ScaleBody { replicas })
                .map_err(|e| ScalerError::backend(e.to_string()))?;
            let path = format!("/api/v1/namespaces/{namespace}/resources/{resource}/scale");
            let (status, body) = self.call(Method::POST, &path, Some(body)).await?;

            if !status.is_success() {
                warn!(%resource, replicas, %status, "control plane rejected scale request");
                return Err(ScalerError::backend(format!(
                    "scaling {resource} to {replicas}: {status} {}",
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            Ok(())
        })
    }

    fn get_resources<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, ScalerResult<Vec<String>>> {
        Box::pin(async move {
            validate_name("namespace", namespace)?;

            let path = format!("/api/v1/namespaces/{namespace}/resources");
            let (status, body) = self.call(Method::GET, &path, None).await?;
            if !status.is_success() {
                return Err(ScalerError::backend(format!("listing resources: {status}")));
            }
            serde_json::from_slice(&body)
                .map_err(|e| ScalerError::backend(format!("decoding resource list: {e}")))
        })
    }

    fn get_config(&self) -> BoxFuture<'_, ScalerResult<Option<BackendConfig>>> {
        Box::pin(async move {
            let (status, body) = self.call(Method::GET, "/api/v1/config", None).await?;
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(ScalerError::backend(format!("fetching config: {status}")));
            }
            serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| ScalerError::backend(format!("decoding config: {e}")))
        })
    }
}
