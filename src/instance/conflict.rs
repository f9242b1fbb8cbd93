use crate::instance::ServerInstance;
use crate::plugin::DebugInfo;
use std::sync::Arc;

/// Another registered instance already bound to the debug transport this
/// instance wants to start on.
#[derive(Clone)]
pub struct ConflictData {
    instance: Arc<ServerInstance>,
    debug_info: DebugInfo,
}

impl ConflictData {
    pub(crate) fn new(instance: Arc<ServerInstance>, debug_info: DebugInfo) -> Self {
        Self {
            instance,
            debug_info,
        }
    }

    /// The instance already occupying the transport
    pub fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }

    /// The contested transport description
    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }
}

/// Policy hook deciding how to handle resource conflicts between instances.
///
/// An interactive host asks the user; a headless host decides by policy.
/// Returning `false` aborts the operation that hit the conflict.
pub trait ConflictResolver: Send + Sync {
    /// Whether the instance occupying the contested debug transport should
    /// be stopped so the new start can proceed
    fn resolve_debugger_conflict(&self, conflict: &ConflictData) -> bool;

    /// Whether the named instance, currently running under the profiler,
    /// may be stopped so another profiling session can start
    fn resolve_profiler_conflict(&self, display_name: &str) -> bool {
        let _ = display_name;
        false
    }
}

/// Resolver that refuses every conflict; the safe headless default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefuseConflicts;

impl ConflictResolver for RefuseConflicts {
    fn resolve_debugger_conflict(&self, _conflict: &ConflictData) -> bool {
        false
    }
}
