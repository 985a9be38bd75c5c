//! In-process backend.
//!
//! Keeps a replica count per resource in a table. Every `set_scale` call is
//! recorded, so tests can assert exactly which scale commands were issued,
//! and failures or latency can be injected to exercise the error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::backend::{BoxFuture, ResourceScaler};
use crate::config::BackendConfig;
use crate::error::{ScalerError, ScalerResult};
use crate::types::validate_name;

/// A recorded `set_scale` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleCall {
    pub resource: String,
    pub replicas: u32,
}

/// Replica table backend.
pub struct MemoryScaler {
    namespace: String,
    replicas: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ScaleCall>>,
    /// Calls that actually changed a replica count.
    changes: AtomicU64,
    config: Option<BackendConfig>,
    scale_delay: Duration,
    fail_scale: AtomicBool,
    fail_list: AtomicBool,
}

impl MemoryScaler {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            replicas: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            changes: AtomicU64::new(0),
            config: None,
            scale_delay: Duration::ZERO,
            fail_scale: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        }
    }

    /// Return `config` from `get_config`.
    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Make every `set_scale` call take `delay` before it resolves.
    pub fn with_scale_delay(mut self, delay: Duration) -> Self {
        self.scale_delay = delay;
        self
    }

    /// Register a resource at the given replica count.
    pub fn insert(&self, resource: &str, replicas: u32) -> ScalerResult<()> {
        validate_name("resource", resource)?;
        lock(&self.replicas).insert(resource.to_string(), replicas);
        Ok(())
    }

    /// Forget a resource, as if it had been deleted from the platform.
    pub fn remove(&self, resource: &str) {
        lock(&self.replicas).remove(resource);
    }

    /// Current replica count, or `None` for unknown resources.
    pub fn replicas(&self, resource: &str) -> Option<u32> {
        lock(&self.replicas).get(resource).copied()
    }

    /// Every `set_scale` call so far, in arrival order.
    pub fn calls(&self) -> Vec<ScaleCall> {
        lock(&self.calls).clone()
    }

    /// How many times `set_scale(resource, replicas)` was called.
    pub fn call_count(&self, resource: &str, replicas: u32) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.resource == resource && c.replicas == replicas)
            .count()
    }

    /// How many calls changed a replica count.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    /// Make `set_scale` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_scale.store(failing, Ordering::SeqCst);
    }

    /// Make `get_resources` fail until reset.
    pub fn set_list_failing(&self, failing: bool) {
        self.fail_list.store(failing, Ordering::SeqCst);
    }

    fn check_namespace(&self, namespace: &str) -> ScalerResult<()> {
        if namespace != self.namespace {
            return Err(ScalerError::backend(format!(
                "namespace {namespace:?} is not served by this backend"
            )));
        }
        Ok(())
    }
}

impl ResourceScaler for MemoryScaler {
    fn set_scale<'a>(
        &'a self,
        namespace: &'a str,
        resource: &'a str,
        replicas: u32,
    ) -> BoxFuture<'a, ScalerResult<()>> {
        Box::pin(async move {
            lock(&self.calls).push(ScaleCall {
                resource: resource.to_string(),
                replicas,
            });

            if !self.scale_delay.is_zero() {
                tokio::time::sleep(self.scale_delay).await;
            }
            if self.fail_scale.load(Ordering::SeqCst) {
                return Err(ScalerError::backend(format!("injected failure scaling {resource}")));
            }
            self.check_namespace(namespace)?;

            let mut table = lock(&self.replicas);
            let current = table
                .get_mut(resource)
                .ok_or_else(|| ScalerError::backend(format!("resource {resource} not found")))?;
            if *current != replicas {
                debug!(%resource, from = *current, to = replicas, "memory backend scaled");
                *current = replicas;
                self.changes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn get_resources<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, ScalerResult<Vec<String>>> {
        Box::pin(async move {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(ScalerError::backend("injected failure listing resources"));
            }
            if namespace != self.namespace {
                return Ok(Vec::new());
            }
            Ok(lock(&self.replicas).keys().cloned().collect())
        })
    }

    fn get_config(&self) -> BoxFuture<'_, ScalerResult<Option<BackendConfig>>> {
        Box::pin(async move { Ok(self.config.clone()) })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
