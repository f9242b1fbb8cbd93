/*!
 # Deploy Runner

 A Rust library for orchestrating application deployment to managed app
 servers through pluggable, vendor-supplied backends.

 ## Overview

 Deploy Runner provides functionality to:
 - Start, stop, restart, debug, and profile configured server instances
 - Triage deployments into first-time distribution, incremental redeploy,
   and undeploy of stale modules
 - Diff a module's build output against the deployed directory and copy
   only what changed
 - Coalesce save-triggered artifact notifications into debounced
   incremental deployments

 ## Basic Usage

 ```no_run
 use deploy_runner::{DeployRunner, Result};
 use std::sync::Arc;

 # fn acme_plugin() -> Arc<dyn deploy_runner::plugin::ServerPlugin> { unimplemented!() }
 #[tokio::main]
 async fn main() -> Result<()> {
     // Create a runner from a config file
     let runner = DeployRunner::from_config_file("config.json")?;

     // Teach it how to talk to the backend
     runner.register_plugin(acme_plugin());

     // Register all configured instances
     runner.register_instances()?;

     // Start one of them
     runner.start_instance("deployer:acme:localhost").await?;

     // Check where it ended up
     let state = runner.instance_state("deployer:acme:localhost")?;
     println!("Server is {}", state);

     Ok(())
 }
 ```

 ## Features

 - **Lifecycle State Machine**: start/stop/debug/profile transitions with
   conflict detection between instances
 - **Incremental Distribution**: content diffing with semantic change
   classification
 - **Deploy on Save**: debounced, coalesced redeployment of changed
   artifacts
 - **Configuration**: JSON or YAML config files
 - **Error Handling**: comprehensive error handling
 - **Async Support**: full async/await support

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod deploy;
pub mod error;
pub mod instance;
pub mod logging;
pub mod module;
pub mod plugin;
pub mod registry;

pub use config::Config;
pub use deploy::{
    AppChanges, DeployOnSaveManager, DeploymentState, MissingModulePolicy, ModuleProvider,
    TargetServer,
};
pub use error::{Error, Result};
pub use instance::{ConflictResolver, ServerInstance, ServerState};
pub use module::{TargetModule, TargetModuleStore};
pub use plugin::{PluginRegistry, ServerPlugin, TargetRef};
pub use registry::ServerRegistry;

use crate::plugin::progress::LogProgressSink;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Configure and drive managed server instances
///
/// This struct is the main entry point for managing server lifecycles and
/// running deployments against them.
/// All public methods are instrumented with `tracing` spans.
pub struct DeployRunner {
    /// Configuration
    config: Config,
    /// Backend plugins
    plugins: Arc<PluginRegistry>,
    /// Server instances and shared policy hooks
    registry: Arc<ServerRegistry>,
    /// Persisted deployed-module records
    module_store: Arc<TargetModuleStore>,
    /// Deploy-on-save scheduler, spawned on first use
    deploy_on_save: OnceLock<DeployOnSaveManager>,
}

impl DeployRunner {
    /// Create a new runner from a configuration file path
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        Ok(Self::new(config))
    }

    /// Create a new runner from a configuration string (JSON)
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Ok(Self::new(config))
    }

    /// Create a new runner from a configuration
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config), fields(num_instances = config.server_instances.len()))]
    pub fn new(config: Config) -> Self {
        tracing::info!("Creating new DeployRunner");
        let plugins = Arc::new(PluginRegistry::new());
        let registry = ServerRegistry::new(Arc::clone(&plugins), config.tuning.clone());
        let cache_dir = config
            .module_cache_dir
            .clone()
            .unwrap_or_else(default_module_cache_dir);
        Self {
            config,
            plugins,
            registry,
            module_store: Arc::new(TargetModuleStore::new(cache_dir)),
            deploy_on_save: OnceLock::new(),
        }
    }

    /// Register a backend plugin
    pub fn register_plugin(&self, plugin: Arc<dyn ServerPlugin>) {
        self.plugins.register(plugin);
    }

    /// The server registry, for direct access to instances and for
    /// installing policy hooks (conflict resolver, profiler)
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// The store of persisted deployed-module records
    pub fn module_store(&self) -> &Arc<TargetModuleStore> {
        &self.module_store
    }

    /// Register every configured server instance with the registry.
    ///
    /// Plugins referenced by the configuration must be registered first.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub fn register_instances(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        for (url, instance_config) in &self.config.server_instances {
            if self.registry.instance(url).is_some() {
                tracing::debug!(instance = %url, "Instance already registered");
                continue;
            }
            self.registry.add_instance(url, instance_config.clone())?;
            urls.push(url.clone());
        }
        tracing::info!(num_registered = urls.len(), "Registered configured instances");
        Ok(urls)
    }

    /// Start a server instance
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub async fn start_instance(&self, url: &str) -> Result<()> {
        tracing::info!("Attempting to start instance");
        let instance = self.registry.require_instance(url)?;
        instance.start(&LogProgressSink).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to start instance");
            e
        })
    }

    /// Start a server instance in debug mode
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub async fn start_instance_debug(&self, url: &str) -> Result<()> {
        tracing::info!("Attempting to start instance in debug mode");
        let instance = self.registry.require_instance(url)?;
        instance.start_debug(&LogProgressSink).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to start instance in debug mode");
            e
        })
    }

    /// Start a server instance in profile mode
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub async fn start_instance_profile(&self, url: &str, force_restart: bool) -> Result<()> {
        tracing::info!("Attempting to start instance in profile mode");
        let instance = self.registry.require_instance(url)?;
        instance
            .start_profile(force_restart, &LogProgressSink)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to start instance in profile mode");
                e
            })
    }

    /// Restart a server instance in the mode it was running in before
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub async fn restart_instance(&self, url: &str) -> Result<()> {
        tracing::info!("Attempting to restart instance");
        let instance = self.registry.require_instance(url)?;
        instance.restart(&LogProgressSink).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to restart instance");
            e
        })
    }

    /// Stop a server instance
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub async fn stop_instance(&self, url: &str) -> Result<()> {
        tracing::info!("Attempting to stop instance");
        let instance = self.registry.require_instance(url)?;
        instance.stop(&LogProgressSink).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to stop instance");
            e
        })
    }

    /// Start all registered instances
    ///
    /// Instances are started sequentially; failures are collected and the
    /// aggregate reported after every instance was attempted.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn start_all_instances(&self) -> Result<Vec<String>> {
        tracing::info!("Starting all registered instances");
        let mut started = Vec::new();
        let mut errors: Vec<(String, Error)> = Vec::new();

        for instance in self.registry.instances() {
            let url = instance.url().to_string();
            match instance.start(&LogProgressSink).await {
                Ok(()) => started.push(url),
                Err(e) => {
                    tracing::error!(instance = %url, error = %e, "Failed to start instance");
                    errors.push((url, e));
                }
            }
        }

        if !errors.is_empty() {
            if errors.len() == 1 {
                return Err(errors.remove(0).1);
            }
            let error_msg = errors
                .iter()
                .map(|(url, e)| format!("{}: {}", url, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Other(format!(
                "Multiple instances failed to start: {}",
                error_msg
            )));
        }

        tracing::info!(num_started = started.len(), "Finished starting all instances");
        Ok(started)
    }

    /// Stop all registered instances
    ///
    /// Failures are collected; the first error is returned after every
    /// instance was attempted.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all_instances(&self) -> Result<()> {
        tracing::info!("Stopping all registered instances");
        let mut errors: Vec<(String, Error)> = Vec::new();

        for instance in self.registry.instances() {
            let url = instance.url().to_string();
            if let Err(e) = instance.stop(&LogProgressSink).await {
                tracing::error!(instance = %url, error = %e, "Failed to stop instance");
                errors.push((url, e));
            }
        }

        if errors.is_empty() {
            tracing::info!("All instances stopped successfully");
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0).1)
        } else {
            let error_msg = errors
                .iter()
                .map(|(url, e)| format!("{}: {}", url, e))
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::Other(format!(
                "Multiple instances failed to stop: {}",
                error_msg
            )))
        }
    }

    /// Last known lifecycle state of an instance
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(instance = %url))]
    pub fn instance_state(&self, url: &str) -> Result<ServerState> {
        tracing::debug!("Getting instance state");
        self.registry
            .require_instance(url)
            .map(|instance| instance.state())
    }

    /// Last known lifecycle states of all registered instances
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub fn all_instance_states(&self) -> HashMap<String, ServerState> {
        tracing::debug!("Getting state for all registered instances");
        let mut states = HashMap::new();
        for instance in self.registry.instances() {
            states.insert(instance.url().to_string(), instance.state());
        }
        states
    }

    /// Build a deployment session for a module against an instance.
    ///
    /// With `targets` empty the session covers every target the instance
    /// administers.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, provider), fields(instance = %url))]
    pub async fn deployment_session(
        &self,
        url: &str,
        provider: Arc<dyn ModuleProvider>,
        targets: Vec<TargetRef>,
    ) -> Result<TargetServer> {
        let instance = self.registry.require_instance(url)?;
        let targets = if targets.is_empty() {
            instance.targets().await?
        } else {
            targets
        };
        Ok(TargetServer::new(
            instance,
            provider,
            targets,
            Arc::clone(&self.module_store),
        ))
    }

    /// Deploy a module to an instance and return the resulting records
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, provider), fields(instance = %url))]
    pub async fn deploy(
        &self,
        url: &str,
        provider: Arc<dyn ModuleProvider>,
        targets: Vec<TargetRef>,
        force_redeploy: bool,
    ) -> Result<Vec<TargetModule>> {
        let session = self.deployment_session(url, provider, targets).await?;
        session.deploy(&LogProgressSink, force_redeploy).await
    }

    /// The deploy-on-save scheduler, spawned on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn deploy_on_save(&self) -> &DeployOnSaveManager {
        self.deploy_on_save
            .get_or_init(|| DeployOnSaveManager::new(self.config.tuning.deploy_on_save_delay()))
    }

    /// Watch a module for deploy on save: build a deployment session and
    /// register it under the given provider key.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, provider), fields(instance = %url, provider_key = %key))]
    pub async fn watch_module(
        &self,
        key: &str,
        url: &str,
        provider: Arc<dyn ModuleProvider>,
        targets: Vec<TargetRef>,
    ) -> Result<()> {
        let session = self.deployment_session(url, provider, targets).await?;
        self.deploy_on_save().register_provider(key, Arc::new(session));
        tracing::info!("Module registered for deploy on save");
        Ok(())
    }
}

/// Default location of the deployed-module record cache
fn default_module_cache_dir() -> PathBuf {
    std::env::temp_dir().join("deploy-runner").join("modules")
}
