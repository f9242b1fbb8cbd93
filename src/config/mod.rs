//! Configuration module for Deploy Runner.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for managed server instances. It supports loading configurations
//! from files or strings in JSON or YAML format.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use deploy_runner::config::Config;
//!
//! let config = Config::from_file("config.json").unwrap();
//! println!("Loaded configuration with {} instances", config.server_instances.len());
//! ```
//!
//! Creating a configuration programmatically:
//! ```
//! use deploy_runner::config::{Config, InstanceConfig, TuningConfig};
//! use std::collections::HashMap;
//!
//! let mut instances = HashMap::new();
//!
//! let instance_config = InstanceConfig {
//!     plugin: "mock".to_string(),
//!     display_name: None,
//!     startup_timeout_secs: None,
//!     shutdown_timeout_secs: None,
//!     deployment_timeout_secs: None,
//!     properties: HashMap::new(),
//! };
//!
//! instances.insert("deployer:mock:localhost".to_string(), instance_config);
//! let config = Config {
//!     server_instances: instances,
//!     module_cache_dir: None,
//!     tuning: TuningConfig::default(),
//! };
//! ```
mod parser;
pub mod validator;

pub use parser::{Config, DEFAULT_TIMEOUT_SECS, InstanceConfig, TuningConfig};
pub use validator::validate_config;
