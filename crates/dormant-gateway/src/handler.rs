//! Request handling: resolve the target, activate it, proxy to it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use dormant_activator::{ActivationError, Coordinator};
use dormant_core::client::{self, ClientError};
use dormant_core::{ScalerConfig, validate_name};

use crate::tracker::RequestTracker;

/// Largest request body buffered for the upstream.
pub const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Why a request was not proxied.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing target name header {0}")]
    MissingTargetName(HeaderName),

    #[error("invalid target name: {0}")]
    InvalidTargetName(String),

    #[error("invalid target path: {0}")]
    InvalidTargetPath(String),

    #[error("reading request body failed: {0}")]
    RequestBody(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("activating {resource} failed: {source}")]
    Activation {
        resource: String,
        #[source]
        source: ActivationError,
    },

    #[error("upstream {authority} failed: {source}")]
    Upstream {
        authority: String,
        #[source]
        source: ClientError,
    },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTargetName(_)
            | Self::InvalidTargetName(_)
            | Self::InvalidTargetPath(_)
            | Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Activation { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Activation { .. } => StatusCode::BAD_GATEWAY,
            Self::Upstream { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Plain-text error response.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status();
        let mut resp = Response::new(Full::new(Bytes::from(format!("{self}\n"))));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp
    }
}

/// Activate-then-proxy request handler.
pub struct Gateway {
    name_header: HeaderName,
    path_header: HeaderName,
    target_port: u16,
    activation_deadline: Duration,
    upstream_timeout: Duration,
    max_body: usize,
    coordinator: Coordinator,
    tracker: Arc<RequestTracker>,
}

impl Gateway {
    pub fn new(
        config: &ScalerConfig,
        coordinator: Coordinator,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            name_header: config.target_name_header.clone(),
            path_header: config.target_path_header.clone(),
            target_port: config.target_port,
            activation_deadline: config.activation_deadline,
            upstream_timeout: config.upstream_timeout,
            max_body: MAX_REQUEST_BODY,
            coordinator,
            tracker,
        }
    }

    /// Override the request body cap (default [`MAX_REQUEST_BODY`]).
    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    /// Handle one request. Failures are rendered as error responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.try_handle(req).await {
            Ok(resp) => resp,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    warn!(error = %e, %status, "request not proxied");
                } else {
                    debug!(error = %e, %status, "request rejected");
                }
                e.into_response()
            }
        }
    }

    async fn try_handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let resource = self.target_name(req.headers())?;
        self.check_declared_length(req.headers())?;
        self.tracker.record(&resource);

        let deadline = Instant::now() + self.activation_deadline;
        self.coordinator
            .ensure_active(&resource, deadline)
            .await
            .map_err(|source| GatewayError::Activation {
                resource: resource.clone(),
                source,
            })?;

        let authority = format!("{resource}:{}", self.target_port);
        let upstream_req = self.upstream_request(req, &authority).await?;
        debug!(
            %resource,
            method = %upstream_req.method(),
            uri = %upstream_req.uri(),
            "proxying request"
        );

        let resp = client::send(&authority, upstream_req, self.upstream_timeout)
            .await
            .map_err(|source| GatewayError::Upstream {
                authority: authority.clone(),
                source,
            })?;

        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Full::new(body)))
    }

    fn target_name(&self, headers: &HeaderMap) -> Result<String, GatewayError> {
        let raw = headers
            .get(&self.name_header)
            .ok_or_else(|| GatewayError::MissingTargetName(self.name_header.clone()))?;
        let name = raw
            .to_str()
            .map_err(|_| GatewayError::InvalidTargetName("not visible ASCII".into()))?
            .trim();
        if name.is_empty() {
            return Err(GatewayError::MissingTargetName(self.name_header.clone()));
        }
        validate_name("resource", name)
            .map_err(|e| GatewayError::InvalidTargetName(e.to_string()))?;
        Ok(name.to_string())
    }

    /// Reject bodies whose declared length is over the cap before anything
    /// is activated.
    fn check_declared_length(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        match declared {
            Some(len) if len > self.max_body as u64 => {
                Err(GatewayError::PayloadTooLarge(self.max_body))
            }
            _ => Ok(()),
        }
    }

    /// Rebuild `req` for the upstream: path override, clean headers,
    /// buffered body.
    async fn upstream_request<B>(
        &self,
        req: Request<B>,
        authority: &str,
    ) -> Result<Request<Full<Bytes>>, GatewayError>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();

        let path_override = parts
            .headers
            .get(&self.path_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| if p.starts_with('/') { p.to_string() } else { format!("/{p}") });
        let path_and_query = match path_override {
            Some(path) => path,
            None => parts
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
        };
        parts.uri = path_and_query.parse().map_err(|e| {
            GatewayError::InvalidTargetPath(format!("{path_and_query:?}: {e}"))
        })?;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(&self.name_header);
        parts.headers.remove(&self.path_header);
        parts.headers.remove(header::CONTENT_LENGTH);
        let host = HeaderValue::from_str(authority)
            .map_err(|e| GatewayError::InvalidTargetName(e.to_string()))?;
        parts.headers.insert(header::HOST, host);

        let body = Limited::new(body, self.max_body)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    GatewayError::PayloadTooLarge(self.max_body)
                } else {
                    GatewayError::RequestBody(e.to_string())
                }
            })?
            .to_bytes();

        Ok(Request::from_parts(parts, Full::new(body)))
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
