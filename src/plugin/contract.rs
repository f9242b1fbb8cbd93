//! Trait contract implemented by vendor backend plugins.
//!
//! A plugin bridges the runner to one kind of application server. The
//! required surface is small: create deployment managers and report
//! targets/modules. Everything else is an optional capability probed
//! through the [`ServerPlugin`] factory methods, mirroring how server
//! support varies between vendors.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::progress::ProgressHandle;
use crate::deploy::AppChanges;

/// Backend target handle (an admin server may manage several targets)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    /// Target name, unique within one server instance
    pub name: String,
    /// Optional human readable description
    pub description: Option<String>,
}

impl TargetRef {
    /// Create a target handle with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Backend-assigned handle of a deployed module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Module id assigned by the backend on distribute/redeploy
    pub id: String,
    /// Name of the target the module runs on
    pub target_name: String,
    /// Web context URL, when the module is a web application
    pub web_url: Option<String>,
}

/// Kind of a deployable module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Web application archive
    Web,
    /// Enterprise bean archive
    Ejb,
    /// Enterprise application archive
    Ear,
    /// Application client archive
    Client,
    /// Resource adapter archive
    Connector,
}

/// Static description of the module handed to a plugin for deployment
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    /// Module display name
    pub name: String,
    /// Module kind
    pub kind: ModuleKind,
    /// Context root for web modules
    pub context_root: Option<String>,
    /// Unpacked content directory, when the build produces one
    pub content_dir: Option<PathBuf>,
    /// Packaged archive, when the build produces one
    pub archive_path: Option<PathBuf>,
}

/// Content passed to distribute/redeploy operations
#[derive(Debug, Clone)]
pub enum DeploymentContent {
    /// A packaged archive file
    Archive(PathBuf),
    /// An unpacked content directory
    Directory(PathBuf),
}

impl DeploymentContent {
    /// Path of the archive or directory
    pub fn path(&self) -> &Path {
        match self {
            DeploymentContent::Archive(p) | DeploymentContent::Directory(p) => p,
        }
    }
}

/// Transport a debuggable server listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugTransport {
    /// Socket attach transport
    Socket {
        /// Host the debug agent listens on
        host: String,
        /// Port the debug agent listens on
        port: u16,
    },
    /// Shared memory attach transport
    SharedMemory {
        /// Shared memory segment name
        name: String,
    },
}

/// Debug attach information reported by a backend for a started target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    /// Attach transport
    pub transport: DebugTransport,
}

impl DebugInfo {
    /// Whether two attach descriptions claim the same transport endpoint
    pub fn conflicts_with(&self, other: &DebugInfo) -> bool {
        match (&self.transport, &other.transport) {
            (
                DebugTransport::Socket { host, port },
                DebugTransport::Socket {
                    host: other_host,
                    port: other_port,
                },
            ) => port == other_port && same_host(host, other_host),
            (
                DebugTransport::SharedMemory { name },
                DebugTransport::SharedMemory { name: other_name },
            ) => name.eq_ignore_ascii_case(other_name),
            _ => false,
        }
    }
}

/// Hostname equivalence for debug transport conflicts.
///
/// Exact matches and the well-known localhost spellings are considered the
/// same machine; anything else is treated as distinct.
pub(crate) fn same_host(first: &str, second: &str) -> bool {
    if first.eq_ignore_ascii_case(second) {
        return true;
    }
    let localhost = |name: &str| {
        name.eq_ignore_ascii_case("localhost") || name == "127.0.0.1" || name == "::1"
    };
    localhost(first) && localhost(second)
}

/// Query used to resolve shared module identities across targets
#[derive(Debug, Clone, Default)]
pub struct ModuleQuery {
    /// Match modules claiming this context root
    pub context_root: Option<String>,
    /// Match modules with this backend id
    pub module_id: Option<String>,
}

/// State reported by a profiler integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerState {
    /// No profiling session
    Inactive,
    /// Profiler agent is starting
    Starting,
    /// Server JVM is blocked waiting for the profiler to connect
    Blocking,
    /// Profiler is attached and collecting
    Profiling,
    /// Profiled process is running without active collection
    Running,
}

/// Connection to a deployed server, the core capability of every plugin.
///
/// One manager represents one (possibly disconnected) session against the
/// backend's administration interface.
#[async_trait]
pub trait DeploymentManager: Send + Sync {
    /// Targets this manager administers
    async fn targets(&self) -> Result<Vec<TargetRef>>;

    /// Modules currently known to the backend on the given targets
    async fn available_modules(&self, targets: &[TargetRef]) -> Result<Vec<ModuleRef>>;

    /// Distribute new content to the given targets
    async fn distribute(
        &self,
        targets: &[TargetRef],
        content: &DeploymentContent,
    ) -> Result<ProgressHandle>;

    /// Replace the content of already deployed modules
    async fn redeploy(
        &self,
        modules: &[ModuleRef],
        content: &DeploymentContent,
    ) -> Result<ProgressHandle>;

    /// Remove deployed modules
    async fn undeploy(&self, modules: &[ModuleRef]) -> Result<ProgressHandle>;

    /// Start deployed modules
    async fn start_modules(&self, modules: &[ModuleRef]) -> Result<ProgressHandle>;

    /// Release the connection; the manager must not be used afterwards
    fn release(&self);
}

/// Lifecycle control over the server process, an optional capability.
///
/// Capability probes (`supports_*`, `needs_*`) are synchronous and must be
/// cheap; the state probes (`is_running`, `is_debuggable`, `is_suspended`)
/// may touch the wire and are bounded by the runner's safe-test timeout.
#[async_trait]
pub trait StartControl: Send + Sync {
    /// Whether the server (or a specific target) is running
    async fn is_running(&self, target: Option<&TargetRef>) -> bool;

    /// Whether a debugger could attach to the server (or target)
    async fn is_debuggable(&self, target: Option<&TargetRef>) -> bool;

    /// Whether the attached debugger currently has the server suspended
    async fn is_suspended(&self) -> bool {
        false
    }

    /// Whether the admin server is also the target server
    fn is_also_target_server(&self, _target: Option<&TargetRef>) -> bool {
        true
    }

    /// Whether the plugin can start and stop the admin server
    fn supports_start_deployment_manager(&self) -> bool;

    /// Whether the plugin can start the server in debug mode
    fn supports_start_debugging(&self, target: Option<&TargetRef>) -> bool;

    /// Whether the plugin can start the server under a profiler
    fn supports_start_profiling(&self, _target: Option<&TargetRef>) -> bool {
        false
    }

    /// Whether a pending configuration change requires a restart before the
    /// target can be used
    fn needs_restart(&self, _target: Option<&TargetRef>) -> bool {
        false
    }

    /// Whether listing targets requires a running admin server
    fn needs_start_for_target_list(&self) -> bool {
        false
    }

    /// Whether the server can be stopped without progress feedback
    fn can_stop_silently(&self) -> bool {
        false
    }

    /// Fire-and-forget stop used on shutdown paths
    async fn stop_silently(&self) {}

    /// Start the admin server
    async fn start_deployment_manager(&self) -> Result<ProgressHandle>;

    /// Start the admin server in debug mode
    async fn start_debugging(&self, target: Option<&TargetRef>) -> Result<ProgressHandle>;

    /// Start the admin server under a profiler
    async fn start_profiling(&self, target: Option<&TargetRef>) -> Result<ProgressHandle>;

    /// Stop the admin server
    async fn stop_deployment_manager(&self) -> Result<ProgressHandle>;

    /// Start a managed sub-target
    async fn start_target(&self, target: &TargetRef) -> Result<ProgressHandle>;

    /// Stop a managed sub-target
    async fn stop_target(&self, target: &TargetRef) -> Result<ProgressHandle>;

    /// Debug attach information for a target started in debug mode
    async fn debug_info(&self, target: Option<&TargetRef>) -> Option<DebugInfo>;
}

/// File-based deployment, an optional capability.
///
/// Backends exposing this skip archive packaging: first-time content is
/// copied into a backend-chosen directory and later saves are applied as
/// classified change sets.
#[async_trait]
pub trait IncrementalDeployment: Send + Sync {
    /// Whether the backend accepts deploy-on-save change sets
    fn supports_deploy_on_save(&self) -> bool {
        false
    }

    /// Whether the given module can be deployed from a directory on the
    /// given target
    async fn can_file_deploy(&self, target: &TargetRef, module: &ModuleSpec) -> bool;

    /// Directory the backend wants first-time content copied into
    async fn directory_for_new_application(
        &self,
        target: &TargetRef,
        module: &ModuleSpec,
    ) -> Option<PathBuf>;

    /// Directory backing an already deployed module
    async fn directory_for_module(&self, module: &ModuleRef) -> Option<PathBuf>;

    /// Announce first-time content already copied to `dest`
    async fn initial_deploy(
        &self,
        target: &TargetRef,
        module: &ModuleSpec,
        dest: &Path,
    ) -> Result<ProgressHandle>;

    /// Apply a classified change set to a deployed module
    async fn incremental_deploy(
        &self,
        module: &ModuleRef,
        changes: &AppChanges,
    ) -> Result<ProgressHandle>;

    /// Apply a deploy-on-save change set to a deployed module
    async fn deploy_on_save(
        &self,
        module: &ModuleRef,
        changes: &AppChanges,
    ) -> Result<ProgressHandle>;
}

/// Resolution of shared module identities, an optional capability.
#[async_trait]
pub trait TargetModuleResolver: Send + Sync {
    /// Modules deployed anywhere on this instance matching the query
    async fn lookup(&self, query: &ModuleQuery) -> Result<Vec<ModuleRef>>;
}

/// A data source configured on or deployable to a server instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datasource {
    /// JNDI name the application looks the data source up under
    pub jndi_name: String,
    /// Database connection URL
    pub url: String,
    /// Driver class name
    pub driver_class: String,
    /// Connection user name
    pub username: Option<String>,
}

/// Kind of a message destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageDestinationKind {
    /// Point-to-point queue
    Queue,
    /// Publish/subscribe topic
    Topic,
}

/// A message destination configured on or deployable to a server instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDestination {
    /// Destination name
    pub name: String,
    /// Queue or topic
    pub kind: MessageDestinationKind,
}

/// Data source administration, an optional capability.
///
/// Errors from these operations carry
/// [`Error::Configuration`](crate::error::Error::Configuration) for
/// malformed data source definitions.
#[async_trait]
pub trait DatasourceManager: Send + Sync {
    /// Data sources deployed on the instance
    async fn datasources(&self) -> Result<Vec<Datasource>>;

    /// Deploy module-defined data sources to the instance
    async fn deploy_datasources(&self, datasources: &[Datasource]) -> Result<()>;
}

/// Message destination administration, an optional capability.
#[async_trait]
pub trait MessageDestinationDeployment: Send + Sync {
    /// Message destinations configured on the instance
    async fn message_destinations(&self) -> Result<Vec<MessageDestination>>;

    /// Deploy module-defined message destinations to the instance
    async fn deploy_message_destinations(
        &self,
        destinations: &[MessageDestination],
    ) -> Result<()>;
}

/// Profiler integration registered on the server registry.
#[async_trait]
pub trait Profiler: Send + Sync {
    /// Current profiler state
    fn state(&self) -> ProfilerState;

    /// Called right before a server is started in profile mode
    fn notify_starting(&self);

    /// Detach the profiler from the profiled process
    async fn shutdown(&self) -> ProgressHandle;
}

/// Factory and capability probe surface of a vendor plugin.
#[async_trait]
pub trait ServerPlugin: Send + Sync {
    /// Stable plugin name referenced from instance configuration
    fn name(&self) -> &str;

    /// Create a connected deployment manager for the given instance URL
    async fn deployment_manager(
        &self,
        url: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn DeploymentManager>>;

    /// Create a disconnected deployment manager; must succeed without a
    /// running server
    async fn disconnected_manager(&self, url: &str) -> Result<Arc<dyn DeploymentManager>>;

    /// Probe the lifecycle-control capability
    fn start_control(&self, manager: &Arc<dyn DeploymentManager>) -> Option<Arc<dyn StartControl>> {
        let _ = manager;
        None
    }

    /// Probe the file-based deployment capability
    fn incremental_deployment(
        &self,
        manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn IncrementalDeployment>> {
        let _ = manager;
        None
    }

    /// Probe the shared-module-identity resolver capability
    fn module_resolver(
        &self,
        manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn TargetModuleResolver>> {
        let _ = manager;
        None
    }

    /// Probe the data source administration capability
    fn datasource_manager(
        &self,
        manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn DatasourceManager>> {
        let _ = manager;
        None
    }

    /// Probe the message destination administration capability
    fn message_destination_deployment(
        &self,
        manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn MessageDestinationDeployment>> {
        let _ = manager;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_conflict_detection() {
        let a = DebugInfo {
            transport: DebugTransport::Socket {
                host: "localhost".to_string(),
                port: 9009,
            },
        };
        let b = DebugInfo {
            transport: DebugTransport::Socket {
                host: "127.0.0.1".to_string(),
                port: 9009,
            },
        };
        let c = DebugInfo {
            transport: DebugTransport::Socket {
                host: "127.0.0.1".to_string(),
                port: 9010,
            },
        };
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
    }

    #[test]
    fn test_shmem_conflict_is_case_insensitive() {
        let a = DebugInfo {
            transport: DebugTransport::SharedMemory {
                name: "Server_A".to_string(),
            },
        };
        let b = DebugInfo {
            transport: DebugTransport::SharedMemory {
                name: "server_a".to_string(),
            },
        };
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn test_socket_never_conflicts_with_shmem() {
        let a = DebugInfo {
            transport: DebugTransport::Socket {
                host: "localhost".to_string(),
                port: 9009,
            },
        };
        let b = DebugInfo {
            transport: DebugTransport::SharedMemory {
                name: "9009".to_string(),
            },
        };
        assert!(!a.conflicts_with(&b));
    }
}
