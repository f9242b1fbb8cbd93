/// Error handling module for Deploy Runner.
///
/// This module defines the error types used throughout the library.
/// It provides a comprehensive set of errors that can occur when
/// orchestrating server lifecycles and deployments, along with helpful
/// context for debugging.
///
/// # Example
///
/// ```
/// use deploy_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::Server(msg)) => println!("Server operation failed: {}", msg),
///         Err(Error::Timeout(msg)) => println!("Operation timed out: {}", msg),
///         Err(Error::InstanceNotFound(url)) => println!("No instance registered for '{}'", url),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the deploy-runner library.
///
/// This enum represents all possible error types that can be returned from
/// operations in the Deploy Runner library. Each variant includes context
/// information to help diagnose and handle the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON or YAML is malformed
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration is well-formed but contains invalid values.
    ///
    /// This error occurs when:
    /// - An instance URL is empty
    /// - A plugin name is empty
    /// - A timeout is zero
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Configuration is valid but fails contextual validation checks.
    ///
    /// This error occurs when:
    /// - A referenced content directory does not exist
    /// - A required field is missing based on context
    #[error("Config validation error: {0}")]
    ConfigValidation(String),

    /// A server lifecycle or deployment operation failed.
    ///
    /// This is the user-facing failure for start/stop/debug/profile
    /// transitions and for distribute/redeploy operations. It carries the
    /// message reported by the backend or a timeout description.
    #[error("Server operation failed: {0}")]
    Server(String),

    /// Malformed data-source, library, or message-destination configuration
    /// reported by the backend plugin.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bounded wait elapsed before the backend signalled completion.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No plugin with the requested name is registered.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// No server instance is registered under the given URL.
    #[error("Server instance not found: {0}")]
    InstanceNotFound(String),

    /// The backend does not know the requested target.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// No deployed module record matches the query.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// A delegate-forwarded query was made against an unresolved module.
    ///
    /// This error occurs when:
    /// - A `TargetModule` has not yet been bound to a backend handle
    /// - The backend handle was dropped by an instance reset
    #[error("Module delegate not resolved: {0}")]
    NotResolved(String),

    /// Content diffing or file copying failed during distribution.
    ///
    /// Wraps the underlying cause. Aborts the affected target's
    /// distribution only; other targets in the same batch are unaffected.
    #[error("Distribution error: {0}")]
    Distribution(String),

    /// The server instance is not running.
    ///
    /// This error occurs when:
    /// - An operation requires a running server but the instance is stopped
    #[error("Not running")]
    NotRunning,

    /// The server instance is already running.
    #[error("Already running")]
    AlreadyRunning,

    /// Error in serializing or deserializing data.
    ///
    /// This error occurs when:
    /// - A persisted module record cannot be written
    /// - A record on disk does not match the expected schema
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    ///
    /// This is a catch-all error for cases not explicitly handled elsewhere.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for deploy-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module. Use this throughout the library and in client code to handle
/// errors in a consistent way.
pub type Result<T> = std::result::Result<T, Error>;
