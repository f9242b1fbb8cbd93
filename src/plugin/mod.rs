//! Backend plugin contract for Deploy Runner.
//!
//! Vendor plugins implement the traits in this module to teach the runner
//! how to drive one kind of application server: lifecycle control,
//! distribution, incremental file deployment, and shared-module-identity
//! resolution. Optional capabilities are probed through `Option`-returning
//! factory methods instead of downcasts, so a plugin only implements what
//! its server actually supports.
//!
//! Plugins are looked up by name in a [`PluginRegistry`] populated at
//! startup; instance configurations reference them through their
//! `plugin` field.

mod contract;
pub mod progress;

pub use contract::{
    Datasource, DatasourceManager, DebugInfo, DebugTransport, DeploymentContent,
    DeploymentManager, IncrementalDeployment, MessageDestination, MessageDestinationDeployment,
    MessageDestinationKind, ModuleKind, ModuleQuery, ModuleRef, ModuleSpec, Profiler,
    ProfilerState, ServerPlugin, StartControl, TargetModuleResolver, TargetRef,
};
pub use progress::{
    LogProgressSink, ProgressEvent, ProgressHandle, ProgressReporter, ProgressSink, ProgressState,
    progress_channel, track_progress,
};

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of backend plugins, keyed by plugin name.
///
/// Populated once at startup from whatever discovery mechanism the host
/// application uses; the runner only ever resolves by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<HashMap<String, Arc<dyn ServerPlugin>>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its reported name.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register(&self, plugin: Arc<dyn ServerPlugin>) {
        let name = plugin.name().to_string();
        tracing::debug!(plugin = %name, "Registering backend plugin");
        self.plugins
            .lock()
            .expect("plugin registry lock poisoned")
            .insert(name, plugin);
    }

    /// Resolve a plugin by name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ServerPlugin>> {
        self.plugins
            .lock()
            .expect("plugin registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                tracing::warn!(plugin = %name, "Requested plugin is not registered");
                Error::PluginNotFound(name.to_string())
            })
    }

    /// Names of all registered plugins
    pub fn names(&self) -> Vec<String> {
        self.plugins
            .lock()
            .expect("plugin registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
