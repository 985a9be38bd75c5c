//! Domain types shared by the activation and scale-down paths.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ScalerError, ScalerResult};

/// Maximum length of a resource id or namespace.
const MAX_NAME_LEN: usize = 253;

/// Activation lifecycle of a single resource.
///
/// Transitions within one activation attempt are
/// `Inactive → Activating → {Active | Error}`. The only way back to
/// `Inactive` is a successful scale-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    /// Scaled to zero, or never observed since the process started.
    #[default]
    Inactive,
    /// A scale-up is in flight; callers attach to it.
    Activating,
    /// At least one replica is ready to serve.
    Active,
    /// The last activation attempt failed; the next request retries.
    Error,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A scalable unit known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub namespace: String,
    pub state: ActivationState,
}

/// One observation of a resource's metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub resource: String,
    pub value: f64,
    pub timestamp: Instant,
}

impl MetricSample {
    pub fn new(resource: impl Into<String>, value: f64, timestamp: Instant) -> Self {
        Self {
            resource: resource.into(),
            value,
            timestamp,
        }
    }
}

/// Check that `name` is usable as a resource id or namespace.
///
/// Names end up in upstream authorities and backend URLs, so they are held
/// to DNS-style rules: lowercase alphanumerics, `-` and `.`, starting and
/// ending with an alphanumeric.
pub fn validate_name(kind: &str, name: &str) -> ScalerResult<()> {
    if name.is_empty() {
        return Err(ScalerError::config(format!("{kind} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ScalerError::config(format!(
            "{kind} {name:?} exceeds {MAX_NAME_LEN} characters"
        )));
    }

    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(ScalerError::config(format!(
            "{kind} {name:?} must start and end with a lowercase letter or digit"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
    {
        return Err(ScalerError::config(format!(
            "{kind} {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_inactive() {
        assert_eq!(ActivationState::default(), ActivationState::Inactive);
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ActivationState::Activating).unwrap();
        assert_eq!(json, "\"activating\"");
        assert_eq!(ActivationState::Error.to_string(), "error");
    }

    #[test]
    fn valid_names_pass() {
        for name in ["svc-a", "a", "api.v2", "0day", "my-func-123"] {
            assert!(validate_name("resource", name).is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", "-svc", "svc-", "Svc", "svc_a", "svc/a", "svc a", "svc:80"] {
            assert!(validate_name("resource", name).is_err(), "{name}");
        }
    }

    #[test]
    fn overlong_name_rejected() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        let err = validate_name("namespace", &name).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
