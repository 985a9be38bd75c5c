//! The backend contract — the only point of contact with whatever
//! platform actually changes replica counts.
//!
//! Implementations must make [`ResourceScaler::set_scale`] idempotent:
//! asking for the scale a resource already has is a successful no-op.

pub mod memory;
pub mod rest;

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{ScalerError, ScalerResult};

pub use self::rest::HttpScaler;
pub use self::memory::MemoryScaler;

/// Boxed future alias used by the dyn-compatible contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scale operations against an orchestration platform.
pub trait ResourceScaler: Send + Sync {
    /// Set `resource` in `namespace` to `replicas` (0 or 1 in practice).
    fn set_scale<'a>(
        &'a self,
        namespace: &'a str,
        resource: &'a str,
        replicas: u32,
    ) -> BoxFuture<'a, ScalerResult<()>>;

    /// Enumerate every resource this backend can scale in `namespace`.
    fn get_resources<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, ScalerResult<Vec<String>>>;

    /// Operational parameters the backend wants enforced, if any.
    ///
    /// `Ok(None)` means "no configuration provided"; callers keep their own.
    fn get_config(&self) -> BoxFuture<'_, ScalerResult<Option<BackendConfig>>>;
}

/// Which backend variant to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process replica table.
    #[default]
    Memory,
    /// REST control plane over HTTP/1.1.
    Http,
}

impl FromStr for BackendKind {
    type Err = ScalerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "http" => Ok(Self::Http),
            other => Err(ScalerError::config(format!(
                "unknown backend kind {other:?} (expected \"memory\" or \"http\")"
            ))),
        }
    }
}

/// Backend choice as written in the `[backend]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSelection {
    pub kind: BackendKind,
    /// Base URL of the control plane (`http` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Resources to seed, all at zero replicas (`memory` only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

/// Construct the backend described by `selection`, scoped to `namespace`.
pub fn build_backend(
    selection: &BackendSelection,
    namespace: &str,
) -> ScalerResult<Arc<dyn ResourceScaler>> {
    match selection.kind {
        BackendKind::Memory => {
            let scaler = MemoryScaler::new(namespace);
            for resource in &selection.resources {
                scaler.insert(resource, 0)?;
            }
            Ok(Arc::new(scaler))
        }
        BackendKind::Http => {
            let url = selection
                .url
                .as_deref()
                .ok_or_else(|| ScalerError::config("http backend requires a url"))?;
            Ok(Arc::new(HttpScaler::new(url)?))
        }
    }
}
