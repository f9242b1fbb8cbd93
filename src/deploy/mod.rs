//! Deployment orchestration.
//!
//! This module hosts the per-session orchestrator ([`TargetServer`]), the
//! content diff engine ([`ServerFileDistributor`]), the change descriptor
//! ([`AppChanges`]), and the deploy-on-save scheduler
//! ([`DeployOnSaveManager`]).

mod changes;
mod distributor;
mod on_save;
pub(crate) mod target_server;

pub use changes::{AppChanges, ModuleDescriptors};
pub use distributor::{DiffMode, InitialServerFileDistributor, ModuleEntry, ServerFileDistributor};
pub use on_save::{DeployOnSaveEvent, DeployOnSaveManager};
pub use target_server::TargetServer;

use crate::error::Result;
use crate::plugin::{Datasource, MessageDestination, ModuleSpec};

/// Outcome of the most recent deployment attempt for a module provider.
///
/// Drives whether the next save triggers a full distribution or an
/// incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    /// The module has never been deployed, or its record is gone
    ModuleNotDeployed,
    /// The module on the server matches the local state
    ModuleUpdated,
    /// The last deployment attempt failed
    DeploymentFailed,
    /// The server is not in a state that supports deployment
    ServerStateUnsupported,
}

/// Policy applied when a previously recorded module is no longer present on
/// the backend.
///
/// The "missing module forces full redeploy" rule exists to work around
/// backend-specific quirks; which backends need it varies, so the rule is a
/// policy choice rather than hardcoded behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingModulePolicy {
    /// Redistribute the module to the affected target
    #[default]
    RedistributeAll,
    /// Drop the stale record and leave the target alone
    Skip,
}

/// Source of deployable content: the build-system side of a module.
///
/// Implementations describe one buildable module: its static spec handed to
/// backend plugins, its descriptor locations for change classification, and
/// its logical archive entries for distribution.
pub trait ModuleProvider: Send + Sync {
    /// Static description of the module
    fn spec(&self) -> ModuleSpec;

    /// Descriptor locations used to classify changed files
    fn descriptors(&self) -> ModuleDescriptors;

    /// Logical archive entries of the current build output
    fn entries(&self) -> Result<Vec<ModuleEntry>>;

    /// Data sources the module defines, deployed to the server before the
    /// module content
    fn datasources(&self) -> Vec<Datasource> {
        Vec::new()
    }

    /// Message destinations the module defines, deployed to the server
    /// before the module content
    fn message_destinations(&self) -> Vec<MessageDestination> {
        Vec::new()
    }
}
