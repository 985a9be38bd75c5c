//! Configuration assembly: defaults, TOML file, flags, then the backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::{info, warn};

use dormant_core::{
    BackendKind, BackendSelection, ConfigFile, ConfigLayer, ResourceScaler, ScalerConfig,
    build_backend,
};

/// Flags shared by `run` and `check-config`. Every flag overrides the
/// matching key in the `[scaler]` or `[backend]` section of `--config`.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// TOML configuration file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Namespace every backend call is scoped to.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Interval between scale-down decisions (e.g. "1m").
    #[arg(long)]
    pub scale_interval: Option<String>,

    /// How long a metric must stay at or below the threshold.
    #[arg(long)]
    pub scale_window: Option<String>,

    /// Metric sampled by the poller ("requests" or "rps").
    #[arg(long)]
    pub metric_name: Option<String>,

    /// Values at or below this count as idle.
    #[arg(long)]
    pub scale_threshold: Option<f64>,

    /// Interval between metric polls.
    #[arg(long, alias = "metrics-poll-interval")]
    pub metrics_interval: Option<String>,

    /// Gateway listen address.
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Header naming the target resource.
    #[arg(long)]
    pub target_name_header: Option<String>,

    /// Header overriding the upstream request path.
    #[arg(long)]
    pub target_path_header: Option<String>,

    /// Port every resource serves on.
    #[arg(long)]
    pub target_port: Option<u16>,

    /// Bound on scale-up plus readiness for one activation attempt.
    #[arg(long)]
    pub activation_timeout: Option<String>,

    /// Longest a single request waits for activation.
    #[arg(long)]
    pub activation_deadline: Option<String>,

    #[arg(long)]
    pub readiness_interval: Option<String>,

    #[arg(long)]
    pub readiness_path: Option<String>,

    /// Timeout for the proxied upstream exchange.
    #[arg(long)]
    pub upstream_timeout: Option<String>,

    /// Backend variant.
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Control plane base URL for the http backend.
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Resources to seed the memory backend with.
    #[arg(long, value_delimiter = ',')]
    pub resources: Vec<String>,
}

impl ConfigArgs {
    fn to_layer(&self) -> ConfigLayer {
        ConfigLayer {
            namespace: self.namespace.clone(),
            scale_interval: self.scale_interval.clone(),
            scale_window: self.scale_window.clone(),
            metric_name: self.metric_name.clone(),
            scale_threshold: self.scale_threshold,
            metrics_interval: self.metrics_interval.clone(),
            listen_address: self.listen_address.clone(),
            target_name_header: self.target_name_header.clone(),
            target_path_header: self.target_path_header.clone(),
            target_port: self.target_port,
            activation_timeout: self.activation_timeout.clone(),
            activation_deadline: self.activation_deadline.clone(),
            readiness_interval: self.readiness_interval.clone(),
            readiness_path: self.readiness_path.clone(),
            upstream_timeout: self.upstream_timeout.clone(),
        }
    }

    fn backend_selection(&self, file: Option<BackendSelection>) -> BackendSelection {
        let mut selection = file.unwrap_or_default();
        if let Some(kind) = self.backend {
            selection.kind = kind;
        }
        if let Some(url) = &self.backend_url {
            selection.url = Some(url.clone());
        }
        if !self.resources.is_empty() {
            selection.resources = self.resources.clone();
        }
        selection
    }
}

/// The effective configuration and the backend it was resolved against.
pub struct Resolved {
    pub config: ScalerConfig,
    pub selection: BackendSelection,
    pub backend: Arc<dyn ResourceScaler>,
}

impl Resolved {
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let file = ConfigFile {
            scaler: self.config.to_layer(),
            backend: Some(self.selection.clone()),
        };
        toml::to_string(&file).context("failed to render configuration")
    }
}

/// Fold every configuration source into one validated config.
///
/// The backend's own configuration has the final say. A backend that
/// cannot be reached for it leaves the local values in place.
pub async fn resolve(args: &ConfigArgs) -> anyhow::Result<Resolved> {
    let file = match &args.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };

    let local = ScalerConfig::from_layers(&[&file.scaler, &args.to_layer()])
        .context("invalid configuration")?;
    let selection = args.backend_selection(file.backend);
    let backend = build_backend(&selection, &local.namespace).context("invalid backend")?;

    let config = match backend.get_config().await {
        Ok(Some(layer)) => {
            info!(backend = ?selection.kind, "applying backend-provided configuration");
            local.apply(&layer).context("backend supplied invalid configuration")?
        }
        Ok(None) => local,
        Err(e) => {
            warn!(error = %e, "backend configuration unavailable, using local values");
            local
        }
    };

    Ok(Resolved {
        config,
        selection,
        backend,
    })
}
