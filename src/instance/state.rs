use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// State is being checked or a transition is in progress
    Waiting,
    /// Server is stopped
    Stopped,
    /// Server is running in normal mode
    Running,
    /// Server is running in debug mode
    Debugging,
    /// Server is suspended on a breakpoint and not responding
    Suspended,
    /// Server is running in profile mode
    Profiling,
    /// Server JVM is blocked waiting for the profiler to connect
    ProfilerBlocking,
    /// Server is starting in profile mode
    ProfilerStarting,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Waiting => "waiting",
            ServerState::Stopped => "stopped",
            ServerState::Running => "running",
            ServerState::Debugging => "debugging",
            ServerState::Suspended => "suspended",
            ServerState::Profiling => "profiling",
            ServerState::ProfilerBlocking => "profiler blocking",
            ServerState::ProfilerStarting => "profiler starting",
        };
        write!(f, "{}", name)
    }
}

/// A state transition published to state listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition
    pub old: ServerState,
    /// State after the transition
    pub new: ServerState,
}
