//! Server instance lifecycle management.
//!
//! The types in this module track one configured server through its
//! lifecycle states and mediate every transition against the backend
//! plugin, including debug-transport conflict detection between instances
//! and the process-wide single-profiling-session invariant.

mod conflict;
mod server_instance;
mod state;

pub use conflict::{ConflictData, ConflictResolver, RefuseConflicts};
pub use server_instance::ServerInstance;
pub use state::{ServerState, StateChange};
