//! Error types shared across dormant components.

use thiserror::Error;

/// Result type alias for core operations.
pub type ScalerResult<T> = Result<T, ScalerError>;

/// Errors raised by configuration, backends and metric sources.
///
/// None of these are fatal once the process is serving: backend and metric
/// failures degrade to "not ready yet" or "skip this cycle". Only a
/// `Configuration` error at startup stops the daemon. Activation timeouts
/// are reported by the activator's own error type.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("metric fetch failed for {resource}: {reason}")]
    MetricFetch { resource: String, reason: String },
}

impl ScalerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn metric(resource: &str, reason: impl Into<String>) -> Self {
        Self::MetricFetch {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}
