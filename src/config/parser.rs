use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default maximum amount of time a server should finish
/// starting/stopping/deploying in, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1200;

/// Configuration for a single managed server instance.
///
/// This structure defines which backend plugin drives the instance and how
/// long the runner waits for lifecycle and deployment operations to finish.
/// Opaque plugin-specific settings travel in `properties`.
///
/// # Examples
///
/// Basic instance configuration:
///
/// ```
/// use deploy_runner::config::InstanceConfig;
/// use std::collections::HashMap;
///
/// let instance_config = InstanceConfig {
///     plugin: "mock".to_string(),
///     display_name: Some("Local mock server".to_string()),
///     startup_timeout_secs: None,
///     shutdown_timeout_secs: None,
///     deployment_timeout_secs: None,
///     properties: HashMap::new(),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// Name of the backend plugin that manages this instance.
    /// Must match a plugin registered in the `PluginRegistry`.
    pub plugin: String,

    /// Human readable name shown in progress and error messages.
    /// Falls back to the instance URL when absent.
    #[serde(default)]
    pub display_name: Option<String>,

    /// Maximum time the server may take to start, in seconds.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,

    /// Maximum time the server may take to stop, in seconds.
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,

    /// Maximum time a deployment session may take, in seconds.
    #[serde(default)]
    pub deployment_timeout_secs: Option<u64>,

    /// Opaque plugin-specific settings (ports, home directories, ...).
    /// These are passed through to the backend plugin untouched.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl InstanceConfig {
    /// Server startup timeout.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Server shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Deployment session timeout.
    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

/// Tuning knobs for the schedulers and pollers.
///
/// These are empirically tuned values. The defaults match long-standing
/// behavior; override them only when a backend is unusually slow or fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningConfig {
    /// Debounce delay for deploy-on-save coalescing, in milliseconds.
    #[serde(default = "default_deploy_on_save_delay_ms")]
    pub deploy_on_save_delay_ms: u64,

    /// Interval between liveness ticks while tracking a backend progress
    /// operation, in milliseconds.
    #[serde(default = "default_progress_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,

    /// For how long a cached `is_running` poll result stays valid,
    /// in milliseconds.
    #[serde(default = "default_running_check_cache_ms")]
    pub running_check_cache_ms: u64,
}

fn default_deploy_on_save_delay_ms() -> u64 {
    300
}

fn default_progress_poll_interval_ms() -> u64 {
    200
}

fn default_running_check_cache_ms() -> u64 {
    2000
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            deploy_on_save_delay_ms: default_deploy_on_save_delay_ms(),
            progress_poll_interval_ms: default_progress_poll_interval_ms(),
            running_check_cache_ms: default_running_check_cache_ms(),
        }
    }
}

impl TuningConfig {
    /// Debounce delay for deploy-on-save coalescing.
    pub fn deploy_on_save_delay(&self) -> Duration {
        Duration::from_millis(self.deploy_on_save_delay_ms)
    }

    /// Liveness tick interval used while tracking progress operations.
    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    /// Validity window of a cached running check.
    pub fn running_check_cache(&self) -> Duration {
        Duration::from_millis(self.running_check_cache_ms)
    }
}

/// Main configuration for the Deploy Runner.
///
/// This structure holds configurations for the server instances managed by
/// the runner, keyed by their connection URL, plus global tuning knobs.
///
/// # JSON Schema
///
/// The configuration follows this JSON schema:
///
/// ```json
/// {
///   "serverInstances": {
///     "deployer:mock:localhost": {
///       "plugin": "mock",
///       "displayName": "Local mock server",
///       "properties": {
///         "port": "8080"
///       }
///     }
///   },
///   "tuning": {
///     "deployOnSaveDelayMs": 300
///   }
/// }
/// ```
///
/// YAML files with the same shape are accepted as well; the format is picked
/// by file extension (`.yaml`/`.yml`).
///
/// # Examples
///
/// Loading a configuration from a file:
///
/// ```no_run
/// use deploy_runner::config::Config;
///
/// let config = Config::from_file("config.json").unwrap();
/// println!("Loaded configuration with {} instances", config.server_instances.len());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Map of instance URLs to their configurations.
    /// The URL is the identity of each server instance.
    pub server_instances: HashMap<String, InstanceConfig>,

    /// Directory for persisted deployed-module records. A temporary
    /// directory is used when omitted; the records are a cache, losing
    /// them only costs a full redistribution.
    #[serde(default)]
    pub module_cache_dir: Option<std::path::PathBuf>,

    /// Scheduler and poller tuning; defaults apply when omitted.
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// JSON is assumed unless the file extension is `.yaml` or `.yml`.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            Self::parse_from_yaml_str(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or the JSON does not
    /// conform to the expected schema.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid YAML or the YAML does not
    /// conform to the expected schema.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_config() {
        let config_str = r#"{
            "serverInstances": {
                "deployer:mock:localhost:8080": {
                    "plugin": "mock",
                    "displayName": "Local mock",
                    "deploymentTimeoutSecs": 60,
                    "properties": { "port": "8080" }
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        assert_eq!(config.server_instances.len(), 1);
        assert!(
            config
                .server_instances
                .contains_key("deployer:mock:localhost:8080")
        );

        let instance = &config.server_instances["deployer:mock:localhost:8080"];
        assert_eq!(instance.plugin, "mock");
        assert_eq!(instance.display_name.as_deref(), Some("Local mock"));
        assert_eq!(instance.deployment_timeout(), Duration::from_secs(60));
        assert_eq!(instance.startup_timeout(), Duration::from_secs(1200));
        assert_eq!(instance.properties["port"], "8080");
    }

    #[test]
    fn test_parse_yaml_config() {
        let config_str = r#"
serverInstances:
  "deployer:mock:localhost":
    plugin: mock
tuning:
  deployOnSaveDelayMs: 150
"#;

        let config = Config::parse_from_yaml_str(config_str).unwrap();
        assert_eq!(config.server_instances.len(), 1);
        assert_eq!(config.tuning.deploy_on_save_delay_ms, 150);
        assert_eq!(config.tuning.progress_poll_interval_ms, 200);
    }
}
