//! Progress objects for long-running backend operations.
//!
//! Every backend operation that may take a while (start, stop, distribute,
//! redeploy, undeploy) returns a [`ProgressHandle`]. The plugin keeps the
//! paired [`ProgressReporter`] and pushes running/completed/failed events
//! into it; the runner awaits the handle under a bounded timeout and
//! forwards intermediate messages to a [`ProgressSink`].

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::ModuleRef;

/// State of a tracked backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Operation is still running
    Running,
    /// Operation finished successfully
    Completed,
    /// Operation failed
    Failed,
    /// Operation handle was released by the backend
    Released,
}

/// A single progress update pushed by a backend plugin
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Operation state
    pub state: ProgressState,
    /// Human readable status message
    pub message: String,
    /// Modules produced by the operation, filled on completion of
    /// distribute/redeploy operations
    pub modules: Vec<ModuleRef>,
}

impl ProgressEvent {
    fn running(message: impl Into<String>) -> Self {
        Self {
            state: ProgressState::Running,
            message: message.into(),
            modules: Vec::new(),
        }
    }
}

/// Producer half of a progress channel, held by the backend plugin.
#[derive(Clone)]
pub struct ProgressReporter {
    sender: Arc<watch::Sender<ProgressEvent>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressReporter")
    }
}

impl ProgressReporter {
    /// Report an intermediate status message
    pub fn progress(&self, message: impl Into<String>) {
        let _ = self.sender.send(ProgressEvent::running(message));
    }

    /// Mark the operation as successfully completed
    pub fn complete(&self, message: impl Into<String>) {
        self.complete_with_modules(message, Vec::new());
    }

    /// Mark the operation as completed, attaching the resulting module
    /// handles (distribute and redeploy report their root modules here)
    pub fn complete_with_modules(&self, message: impl Into<String>, modules: Vec<ModuleRef>) {
        let _ = self.sender.send(ProgressEvent {
            state: ProgressState::Completed,
            message: message.into(),
            modules,
        });
    }

    /// Mark the operation as failed
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.sender.send(ProgressEvent {
            state: ProgressState::Failed,
            message: message.into(),
            modules: Vec::new(),
        });
    }
}

/// Consumer half of a progress channel.
///
/// Cheap to clone; every clone observes the same stream of updates.
#[derive(Clone)]
pub struct ProgressHandle {
    id: Uuid,
    receiver: watch::Receiver<ProgressEvent>,
    // keeps pre-resolved handles alive without a reporter
    _sender: Option<Arc<watch::Sender<ProgressEvent>>>,
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgressHandle({})", self.id)
    }
}

impl ProgressHandle {
    /// Unique id of the tracked operation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current status snapshot
    pub fn status(&self) -> ProgressEvent {
        self.receiver.borrow().clone()
    }

    /// Whether the operation is still making progress
    pub fn is_progressing(&self) -> bool {
        matches!(
            self.receiver.borrow().state,
            ProgressState::Running | ProgressState::Released
        )
    }

    /// Whether the operation has failed
    pub fn has_failed(&self) -> bool {
        self.receiver.borrow().state == ProgressState::Failed
    }

    /// Create a handle that is already completed, for backends that finish
    /// an operation synchronously
    pub fn completed(message: impl Into<String>) -> Self {
        Self::resolved(ProgressState::Completed, message, Vec::new())
    }

    /// Create a handle that is already completed with result modules
    pub fn completed_with_modules(message: impl Into<String>, modules: Vec<ModuleRef>) -> Self {
        Self::resolved(ProgressState::Completed, message, modules)
    }

    /// Create a handle that is already failed
    pub fn failed(message: impl Into<String>) -> Self {
        Self::resolved(ProgressState::Failed, message, Vec::new())
    }

    fn resolved(state: ProgressState, message: impl Into<String>, modules: Vec<ModuleRef>) -> Self {
        let (sender, receiver) = watch::channel(ProgressEvent {
            state,
            message: message.into(),
            modules,
        });
        Self {
            id: Uuid::new_v4(),
            receiver,
            _sender: Some(Arc::new(sender)),
        }
    }

    async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

/// Create a linked reporter/handle pair for an asynchronous operation
pub fn progress_channel(initial_message: impl Into<String>) -> (ProgressReporter, ProgressHandle) {
    let (sender, receiver) = watch::channel(ProgressEvent::running(initial_message));
    let sender = Arc::new(sender);
    (
        ProgressReporter {
            sender: Arc::clone(&sender),
        },
        ProgressHandle {
            id: Uuid::new_v4(),
            receiver,
            _sender: Some(sender),
        },
    )
}

/// Receiver of user-facing progress messages.
///
/// Deployment and lifecycle operations report intermediate status through
/// this trait; implementations forward it to whatever surface the caller
/// has (status bar, log pane, test buffer).
pub trait ProgressSink: Send + Sync {
    /// Record a status message
    fn progress(&self, message: &str);
}

/// Progress sink that forwards every message to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn progress(&self, message: &str) {
        tracing::info!(progress = %message, "operation progress");
    }
}

/// Track a backend progress operation until it settles or a timeout elapses.
///
/// Intermediate messages are forwarded to `sink` as they arrive, with a
/// liveness tick at `poll_interval` re-reporting the last message while the
/// backend stays silent. Returns `Ok(true)` when the operation completed,
/// `Ok(false)` when the backend reported failure.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the operation does not settle within
/// `timeout`.
pub async fn track_progress(
    mut handle: ProgressHandle,
    sink: &dyn ProgressSink,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let snapshot = handle.status();
        match snapshot.state {
            ProgressState::Completed | ProgressState::Released => {
                sink.progress(&snapshot.message);
                return Ok(true);
            }
            ProgressState::Failed => {
                sink.progress(&snapshot.message);
                return Ok(false);
            }
            ProgressState::Running => {}
        }

        tokio::select! {
            changed = handle.changed() => {
                if changed {
                    let event = handle.status();
                    // terminal events are reported by the next loop pass
                    if event.state == ProgressState::Running {
                        sink.progress(&event.message);
                    }
                } else {
                    // reporter dropped without settling, treat as failure
                    tracing::warn!(operation = %handle.id(), "Progress reporter dropped before completion");
                    return Ok(false);
                }
            }
            _ = tokio::time::sleep(poll_interval) => {
                sink.progress(&snapshot.message);
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::Timeout(format!(
                    "Operation {} did not finish in {:?}",
                    handle.id(),
                    timeout
                )));
            }
        }
    }
}
