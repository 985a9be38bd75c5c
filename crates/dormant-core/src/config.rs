//! Operational configuration.
//!
//! Configuration arrives in layers: built-in defaults, a TOML file, command
//! line flags, and finally whatever the backend returns from
//! [`ResourceScaler::get_config`](crate::ResourceScaler::get_config). Each
//! source produces a [`ConfigLayer`] of optional, unparsed values; the
//! layers are folded into one validated [`ScalerConfig`] that is handed to
//! every component at construction and never changes afterwards.
//!
//! ```toml
//! [scaler]
//! namespace = "tenant-a"
//! scale_interval = "30s"
//! scale_window = "5m"
//! metric_name = "requests"
//! scale_threshold = 0.0
//!
//! [backend]
//! kind = "http"
//! url = "http://control-plane:9000"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::backend::BackendSelection;
use crate::error::{ScalerError, ScalerResult};
use crate::types::validate_name;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_METRIC_NAME: &str = "requests";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8090";
pub const DEFAULT_TARGET_NAME_HEADER: &str = "x-dormant-target-name";
pub const DEFAULT_TARGET_PATH_HEADER: &str = "x-dormant-target-path";
pub const DEFAULT_TARGET_PORT: u16 = 8080;

/// A partial set of operational parameters from one configuration source.
///
/// Durations are kept as strings (`"500ms"`, `"30s"`, `"5m"`, `"1h"`, or a
/// bare number of seconds) and only parsed when the layer is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_timeout: Option<String>,
}

/// Static operational parameters supplied by a backend.
///
/// Fields the backend leaves unset keep the value from the lower layers.
pub type BackendConfig = ConfigLayer;

/// On-disk configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub scaler: ConfigLayer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendSelection>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> ScalerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScalerError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| ScalerError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> ScalerResult<Self> {
        toml::from_str(content).map_err(|e| ScalerError::config(e.to_string()))
    }
}

/// The validated, immutable configuration shared by every component.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerConfig {
    /// Namespace every backend call is scoped to.
    pub namespace: String,
    /// How often the decision loop scales down idle-eligible resources.
    pub scale_interval: Duration,
    /// How long a metric must stay at or below the threshold.
    pub scale_window: Duration,
    pub metric_name: String,
    /// Values at or below this count as idle.
    pub scale_threshold: f64,
    /// How often the poller samples metrics.
    pub metrics_interval: Duration,
    pub listen_address: SocketAddr,
    pub target_name_header: HeaderName,
    pub target_path_header: HeaderName,
    /// Port every resource serves on.
    pub target_port: u16,
    /// Upper bound on scale-up plus readiness for one activation attempt.
    pub activation_timeout: Duration,
    /// Ceiling on how long a single request waits for activation.
    pub activation_deadline: Duration,
    pub readiness_interval: Duration,
    pub readiness_path: String,
    pub upstream_timeout: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            scale_interval: Duration::from_secs(60),
            scale_window: Duration::from_secs(60),
            metric_name: DEFAULT_METRIC_NAME.to_string(),
            scale_threshold: 0.0,
            metrics_interval: Duration::from_secs(60),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8090)),
            target_name_header: HeaderName::from_static(DEFAULT_TARGET_NAME_HEADER),
            target_path_header: HeaderName::from_static(DEFAULT_TARGET_PATH_HEADER),
            target_port: DEFAULT_TARGET_PORT,
            activation_timeout: Duration::from_secs(60),
            activation_deadline: Duration::from_secs(90),
            readiness_interval: Duration::from_millis(500),
            readiness_path: "/".to_string(),
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

impl ScalerConfig {
    /// Fold `layers` (lowest precedence first) onto the defaults.
    ///
    /// Only the fully merged result is validated; a later layer may repair
    /// a combination an earlier one left inconsistent.
    pub fn from_layers(layers: &[&ConfigLayer]) -> ScalerResult<Self> {
        let config = layers
            .iter()
            .try_fold(Self::default(), |config, layer| config.merge(layer))?;
        config.validate()?;
        Ok(config)
    }

    /// Return a validated copy of this config with every value set in
    /// `layer` applied.
    pub fn apply(&self, layer: &ConfigLayer) -> ScalerResult<Self> {
        let next = self.merge(layer)?;
        next.validate()?;
        Ok(next)
    }

    /// Overlay `layer` without checking cross-field constraints.
    fn merge(&self, layer: &ConfigLayer) -> ScalerResult<Self> {
        let mut next = self.clone();

        if let Some(ns) = &layer.namespace {
            next.namespace = ns.clone();
        }
        if let Some(s) = &layer.scale_interval {
            next.scale_interval = parse_duration("scale_interval", s)?;
        }
        if let Some(s) = &layer.scale_window {
            next.scale_window = parse_duration("scale_window", s)?;
        }
        if let Some(name) = &layer.metric_name {
            next.metric_name = name.clone();
        }
        if let Some(threshold) = layer.scale_threshold {
            next.scale_threshold = threshold;
        }
        if let Some(s) = &layer.metrics_interval {
            next.metrics_interval = parse_duration("metrics_interval", s)?;
        }
        if let Some(addr) = &layer.listen_address {
            next.listen_address = addr.parse().map_err(|e| {
                ScalerError::config(format!("listen_address {addr:?}: {e}"))
            })?;
        }
        if let Some(h) = &layer.target_name_header {
            next.target_name_header = parse_header("target_name_header", h)?;
        }
        if let Some(h) = &layer.target_path_header {
            next.target_path_header = parse_header("target_path_header", h)?;
        }
        if let Some(port) = layer.target_port {
            next.target_port = port;
        }
        if let Some(s) = &layer.activation_timeout {
            next.activation_timeout = parse_duration("activation_timeout", s)?;
        }
        if let Some(s) = &layer.activation_deadline {
            next.activation_deadline = parse_duration("activation_deadline", s)?;
        }
        if let Some(s) = &layer.readiness_interval {
            next.readiness_interval = parse_duration("readiness_interval", s)?;
        }
        if let Some(path) = &layer.readiness_path {
            next.readiness_path = path.clone();
        }
        if let Some(s) = &layer.upstream_timeout {
            next.upstream_timeout = parse_duration("upstream_timeout", s)?;
        }

        Ok(next)
    }

    /// Reject values no component can operate with.
    pub fn validate(&self) -> ScalerResult<()> {
        validate_name("namespace", &self.namespace)?;

        if self.metric_name.trim().is_empty() {
            return Err(ScalerError::config("metric_name must not be empty"));
        }
        if !self.scale_threshold.is_finite() || self.scale_threshold < 0.0 {
            return Err(ScalerError::config(format!(
                "scale_threshold must be a non-negative number, got {}",
                self.scale_threshold
            )));
        }
        for (field, value) in [
            ("scale_interval", self.scale_interval),
            ("scale_window", self.scale_window),
            ("metrics_interval", self.metrics_interval),
            ("activation_timeout", self.activation_timeout),
            ("activation_deadline", self.activation_deadline),
            ("readiness_interval", self.readiness_interval),
            ("upstream_timeout", self.upstream_timeout),
        ] {
            if value.is_zero() {
                return Err(ScalerError::config(format!("{field} must be greater than zero")));
            }
        }
        if self.target_port == 0 {
            return Err(ScalerError::config("target_port must not be 0"));
        }
        if self.target_name_header == self.target_path_header {
            return Err(ScalerError::config(
                "target_name_header and target_path_header must differ",
            ));
        }
        if !self.readiness_path.starts_with('/') {
            return Err(ScalerError::config(format!(
                "readiness_path must start with '/', got {:?}",
                self.readiness_path
            )));
        }
        Ok(())
    }

    /// Render this config as a fully populated layer (for `check-config`).
    pub fn to_layer(&self) -> ConfigLayer {
        ConfigLayer {
            namespace: Some(self.namespace.clone()),
            scale_interval: Some(format_duration(self.scale_interval)),
            scale_window: Some(format_duration(self.scale_window)),
            metric_name: Some(self.metric_name.clone()),
            scale_threshold: Some(self.scale_threshold),
            metrics_interval: Some(format_duration(self.metrics_interval)),
            listen_address: Some(self.listen_address.to_string()),
            target_name_header: Some(self.target_name_header.to_string()),
            target_path_header: Some(self.target_path_header.to_string()),
            target_port: Some(self.target_port),
            activation_timeout: Some(format_duration(self.activation_timeout)),
            activation_deadline: Some(format_duration(self.activation_deadline)),
            readiness_interval: Some(format_duration(self.readiness_interval)),
            readiness_path: Some(self.readiness_path.clone()),
            upstream_timeout: Some(format_duration(self.upstream_timeout)),
        }
    }
}

fn parse_header(field: &str, value: &str) -> ScalerResult<HeaderName> {
    HeaderName::from_bytes(value.trim().as_bytes())
        .map_err(|_| ScalerError::config(format!("{field} {value:?} is not a valid header name")))
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" or "10".
pub fn parse_duration(field: &str, s: &str) -> ScalerResult<Duration> {
    let s = s.trim();
    let invalid = || ScalerError::config(format!("{field}: invalid duration {s:?}"));

    let (digits, scale): (&str, fn(u64) -> Option<Duration>) =
        if let Some(ms) = s.strip_suffix("ms") {
            (ms, |n| Some(Duration::from_millis(n)))
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, |n| Some(Duration::from_secs(n)))
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, |n| n.checked_mul(60).map(Duration::from_secs))
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, |n| n.checked_mul(3600).map(Duration::from_secs))
        } else {
            (s, |n| Some(Duration::from_secs(n)))
        };

    let n = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    scale(n).ok_or_else(invalid)
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
