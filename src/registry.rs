//! Registry of configured server instances.
//!
//! The registry is an explicitly constructed object passed by reference to
//! every dependent component; there is no process-global state. It owns the
//! instances, the "exactly one profiling session" slot, the optional
//! profiler integration, and the conflict-resolution policy hook.

use crate::config::{InstanceConfig, TuningConfig, validator};
use crate::error::{Error, Result};
use crate::instance::{ConflictResolver, RefuseConflicts, ServerInstance};
use crate::plugin::{PluginRegistry, Profiler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry owning all configured [`ServerInstance`]s.
///
/// Always lives behind an `Arc`; instances keep a weak reference back for
/// conflict scans and the profiled-slot checks.
pub struct ServerRegistry {
    plugins: Arc<PluginRegistry>,
    tuning: TuningConfig,
    instances: Mutex<HashMap<String, Arc<ServerInstance>>>,
    /// URL of the instance currently running under the profiler, if any.
    /// Guarded compare-and-swap access keeps the sessions exclusive.
    profiled: Mutex<Option<String>>,
    profiler: Mutex<Option<Arc<dyn Profiler>>>,
    conflict_resolver: Mutex<Arc<dyn ConflictResolver>>,
}

impl ServerRegistry {
    /// Create a registry backed by the given plugin registry
    pub fn new(plugins: Arc<PluginRegistry>, tuning: TuningConfig) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            tuning,
            instances: Mutex::new(HashMap::new()),
            profiled: Mutex::new(None),
            profiler: Mutex::new(None),
            conflict_resolver: Mutex::new(Arc::new(RefuseConflicts)),
        })
    }

    /// The plugin registry instances resolve their backends from
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Tuning knobs applied to all instances
    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    /// Install a profiler integration
    pub fn set_profiler(&self, profiler: Arc<dyn Profiler>) {
        *self.profiler.lock().expect("profiler lock poisoned") = Some(profiler);
    }

    /// The registered profiler integration, if any
    pub fn profiler(&self) -> Option<Arc<dyn Profiler>> {
        self.profiler.lock().expect("profiler lock poisoned").clone()
    }

    /// Install a conflict-resolution policy. The default refuses every
    /// conflict, which is the safe headless behavior.
    pub fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self
            .conflict_resolver
            .lock()
            .expect("resolver lock poisoned") = resolver;
    }

    /// The active conflict-resolution policy
    pub fn conflict_resolver(&self) -> Arc<dyn ConflictResolver> {
        self.conflict_resolver
            .lock()
            .expect("resolver lock poisoned")
            .clone()
    }

    /// Register a new server instance under its connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for malformed configuration or a
    /// duplicate URL, [`Error::PluginNotFound`] when the referenced plugin
    /// is not registered.
    pub fn add_instance(
        self: &Arc<Self>,
        url: &str,
        config: InstanceConfig,
    ) -> Result<Arc<ServerInstance>> {
        validator::validate_instance_config(url, &config)?;
        let plugin = self.plugins.resolve(&config.plugin)?;

        let mut instances = self.instances.lock().expect("instance lock poisoned");
        if instances.contains_key(url) {
            return Err(Error::ConfigInvalid(format!(
                "Instance '{}' is already registered",
                url
            )));
        }
        let instance = Arc::new(ServerInstance::new(
            url.to_string(),
            config,
            self.tuning.clone(),
            plugin,
            Arc::downgrade(self),
        ));
        instances.insert(url.to_string(), Arc::clone(&instance));
        tracing::info!(instance = %url, "Registered server instance");
        Ok(instance)
    }

    /// Look up an instance by URL
    pub fn instance(&self, url: &str) -> Option<Arc<ServerInstance>> {
        self.instances
            .lock()
            .expect("instance lock poisoned")
            .get(url)
            .cloned()
    }

    /// Look up an instance by URL, failing when absent
    pub fn require_instance(&self, url: &str) -> Result<Arc<ServerInstance>> {
        self.instance(url)
            .ok_or_else(|| Error::InstanceNotFound(url.to_string()))
    }

    /// Snapshot of all registered instances
    pub fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.instances
            .lock()
            .expect("instance lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Remove an instance, stopping it first when this process started it
    pub async fn remove_instance(&self, url: &str) -> Result<()> {
        let instance = {
            let mut instances = self.instances.lock().expect("instance lock poisoned");
            instances.remove(url)
        }
        .ok_or_else(|| Error::InstanceNotFound(url.to_string()))?;

        instance.stop_if_started_by_runner().await;
        self.clear_profiled(url);
        tracing::info!(instance = %url, "Removed server instance");
        Ok(())
    }

    // ---------- profiled slot ----------

    /// URL of the instance currently profiled, if any
    pub fn profiled_url(&self) -> Option<String> {
        self.profiled.lock().expect("profiled lock poisoned").clone()
    }

    /// Whether the given instance holds the profiling slot
    pub fn is_profiled(&self, url: &str) -> bool {
        self.profiled
            .lock()
            .expect("profiled lock poisoned")
            .as_deref()
            == Some(url)
    }

    /// Claim the profiling slot for an instance.
    ///
    /// Overwriting another instance's claim is a bug in the caller; the
    /// slot must be cleared through [`clear_profiled`](Self::clear_profiled)
    /// first.
    pub(crate) fn set_profiled(&self, url: &str) {
        let mut profiled = self.profiled.lock().expect("profiled lock poisoned");
        if let Some(existing) = profiled.as_deref() {
            if existing != url {
                tracing::warn!(
                    existing = %existing,
                    new = %url,
                    "Profiling slot overwritten while still claimed"
                );
            }
        }
        *profiled = Some(url.to_string());
    }

    /// Release the profiling slot if the given instance holds it
    pub(crate) fn clear_profiled(&self, url: &str) {
        let mut profiled = self.profiled.lock().expect("profiled lock poisoned");
        if profiled.as_deref() == Some(url) {
            *profiled = None;
        }
    }
}
