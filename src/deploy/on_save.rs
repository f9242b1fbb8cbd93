//! Deploy-on-save coalescing.
//!
//! Build systems emit a burst of artifact-change notifications on every
//! save. The [`DeployOnSaveManager`] merges them per module provider,
//! debounces the burst on a single worker task, and hands the accumulated
//! delta to the provider's [`TargetServer`] in one deployment attempt.
//! Cancellation of superseded work is best-effort: a batch that started
//! processing runs to completion.

use crate::deploy::target_server::TargetServer;
use crate::deploy::DeploymentState;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Event fired when a provider's module was confirmed updated on the server
#[derive(Debug, Clone)]
pub struct DeployOnSaveEvent {
    /// Key of the provider whose module was updated
    pub provider: String,
}

struct Inner {
    pending: Mutex<HashMap<String, HashSet<PathBuf>>>,
    providers: Mutex<HashMap<String, Arc<TargetServer>>>,
    suspended: Mutex<HashSet<String>>,
    states: Mutex<HashMap<String, DeploymentState>>,
    listeners: broadcast::Sender<DeployOnSaveEvent>,
    delay: Duration,
}

/// Debounce/coalesce scheduler for save-triggered deployments.
///
/// Dropping the manager shuts the worker task down; pending batches that
/// have not started processing are discarded.
pub struct DeployOnSaveManager {
    inner: Arc<Inner>,
    notify: mpsc::UnboundedSender<()>,
}

impl DeployOnSaveManager {
    /// Create a manager with the given debounce delay and spawn its worker
    pub fn new(delay: Duration) -> Self {
        let (notify, wake) = mpsc::unbounded_channel();
        let (listeners, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            pending: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
            states: Mutex::new(HashMap::new()),
            listeners,
            delay,
        });
        tokio::spawn(worker(Arc::clone(&inner), wake));
        Self { inner, notify }
    }

    /// Attach a deployment session to a provider key. Artifact
    /// notifications for the key deploy through this session.
    pub fn register_provider(&self, key: &str, server: Arc<TargetServer>) {
        self.inner
            .providers
            .lock()
            .expect("provider lock poisoned")
            .insert(key.to_string(), server);
    }

    /// Detach a provider; its pending artifacts are dropped
    pub fn unregister_provider(&self, key: &str) {
        self.inner
            .providers
            .lock()
            .expect("provider lock poisoned")
            .remove(key);
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(key);
    }

    /// Temporarily stop reacting to saves for a provider, e.g. during a
    /// manual full build. Registered listeners are kept.
    pub fn suspend_listening(&self, key: &str) {
        self.inner
            .suspended
            .lock()
            .expect("suspended lock poisoned")
            .insert(key.to_string());
    }

    /// Resume reacting to saves for a provider
    pub fn resume_listening(&self, key: &str) {
        self.inner
            .suspended
            .lock()
            .expect("suspended lock poisoned")
            .remove(key);
    }

    /// Merge changed artifacts into the provider's pending set and schedule
    /// a deployment.
    ///
    /// Rapid successive calls before the debounce window closes coalesce
    /// into a single deployment carrying the union of all artifact sets.
    pub fn submit_changed_artifacts(&self, key: &str, artifacts: HashSet<PathBuf>) {
        if self
            .inner
            .suspended
            .lock()
            .expect("suspended lock poisoned")
            .contains(key)
        {
            tracing::debug!(provider = %key, "Provider suspended, dropping artifact notification");
            return;
        }
        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            pending
                .entry(key.to_string())
                .or_default()
                .extend(artifacts);
        }
        let _ = self.notify.send(());
    }

    /// Last deployment state recorded for a provider
    pub fn state_of(&self, key: &str) -> Option<DeploymentState> {
        self.inner
            .states
            .lock()
            .expect("state lock poisoned")
            .get(key)
            .copied()
    }

    /// Subscribe to confirmed module-updated events
    pub fn subscribe(&self) -> broadcast::Receiver<DeployOnSaveEvent> {
        self.inner.listeners.subscribe()
    }
}

/// Single worker loop: debounce, swap the whole pending map, deploy.
async fn worker(inner: Arc<Inner>, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        // absorb rapid successive saves into one deployment: every save
        // arriving within the debounce window restarts the wait
        loop {
            match tokio::time::timeout(inner.delay, wake.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let batch: HashMap<String, HashSet<PathBuf>> = {
            let mut pending = inner.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending)
        };

        for (key, artifacts) in batch {
            if artifacts.is_empty() {
                continue;
            }
            if inner
                .suspended
                .lock()
                .expect("suspended lock poisoned")
                .contains(&key)
            {
                continue;
            }
            let server = inner
                .providers
                .lock()
                .expect("provider lock poisoned")
                .get(&key)
                .cloned();
            let Some(server) = server else {
                tracing::debug!(provider = %key, "No deployment session registered, dropping artifacts");
                continue;
            };

            tracing::debug!(provider = %key, artifacts = artifacts.len(), "Running deploy on save");
            let state = server.notify_artifacts_updated(&artifacts).await;
            inner
                .states
                .lock()
                .expect("state lock poisoned")
                .insert(key.clone(), state);

            if state == DeploymentState::ModuleUpdated {
                let _ = inner.listeners.send(DeployOnSaveEvent { provider: key });
            }
        }
    }
}
