use crate::config::{Config, InstanceConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Validates a single instance configuration
pub fn validate_instance_config(url: &str, config: &InstanceConfig) -> Result<()> {
    if url.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "Instance with empty URL".to_string(),
        ));
    }

    if config.plugin.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Instance '{}' has empty plugin name",
            url
        )));
    }

    // Whether the plugin actually exists is checked when the instance is
    // registered against a PluginRegistry, not here.

    for (name, value) in [
        ("startupTimeoutSecs", config.startup_timeout_secs),
        ("shutdownTimeoutSecs", config.shutdown_timeout_secs),
        ("deploymentTimeoutSecs", config.deployment_timeout_secs),
    ] {
        if value == Some(0) {
            return Err(Error::ConfigInvalid(format!(
                "Instance '{}' has zero {}",
                url, name
            )));
        }
    }

    Ok(())
}

/// Validates a map of instance configurations
pub fn validate_instance_configs(configs: &HashMap<String, InstanceConfig>) -> Result<()> {
    if configs.is_empty() {
        return Err(Error::ConfigInvalid(
            "No server instances configured".to_string(),
        ));
    }

    for (url, config) in configs {
        validate_instance_config(url, config)?;
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_instance_configs(&config.server_instances)?;

    if config.tuning.progress_poll_interval_ms == 0 {
        return Err(Error::ConfigInvalid(
            "tuning.progressPollIntervalMs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}
