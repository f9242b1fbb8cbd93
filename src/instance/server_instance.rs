//! Per-instance lifecycle state machine.
//!
//! A [`ServerInstance`] mediates every start/stop/debug/profile transition
//! of one configured server and keeps a cached view of the backend handles
//! the plugin hands out. State is eventually consistent: explicit
//! transitions and [`ServerInstance::refresh`] can race, and refresh runs
//! after every transition attempt so the instance is never left in
//! `Waiting`.

use crate::config::{InstanceConfig, TuningConfig};
use crate::error::{Error, Result};
use crate::instance::conflict::ConflictData;
use crate::instance::state::{ServerState, StateChange};
use crate::plugin::progress::{
    LogProgressSink, ProgressHandle, ProgressSink, track_progress,
};
use crate::plugin::{
    DebugInfo, DeploymentManager, IncrementalDeployment, ProfilerState, ServerPlugin,
    StartControl, TargetModuleResolver, TargetRef,
};
use crate::registry::ServerRegistry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// For how long a plugin may block in the `is_running` probe
const RUNNING_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// For how long a plugin may block in the `is_debuggable` probe
const DEBUGGING_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Period of the profiler state poller while a profiling session runs
const PROFILER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start mode requested from the lifecycle multiplexer.
///
/// Profile mode never reaches the multiplexer; profiling has its own
/// startup path with the registry's single-session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Run,
    Debug,
}

/// Events recomputing the lifecycle state.
///
/// Every state change funnels through
/// [`ServerInstance::apply_state_event`], guarded by the instance's state
/// mutex; `refresh()` is just another event source, not a privileged path.
#[derive(Debug, Clone, Copy)]
enum StateEvent {
    /// An explicit transition or a refresh cycle began
    TransitionStarted,
    /// A probe cycle finished with these readings
    Probed {
        suspended: bool,
        debuggable: bool,
        running: bool,
    },
    /// The profiler reported this state for the profiled instance
    ProfilerObserved(ProfilerState),
    /// The attached debugger suspended or resumed the server
    DebuggerChanged { suspended: bool },
}

/// Pure transition function of the lifecycle state machine
fn next_state(event: StateEvent) -> ServerState {
    match event {
        StateEvent::TransitionStarted => ServerState::Waiting,
        StateEvent::Probed { suspended: true, .. } => ServerState::Suspended,
        StateEvent::Probed { debuggable: true, .. } => ServerState::Debugging,
        StateEvent::Probed { running: true, .. } => ServerState::Running,
        StateEvent::Probed { .. } => ServerState::Stopped,
        StateEvent::ProfilerObserved(ProfilerState::Starting) => ServerState::ProfilerStarting,
        StateEvent::ProfilerObserved(ProfilerState::Blocking) => ServerState::ProfilerBlocking,
        StateEvent::ProfilerObserved(ProfilerState::Profiling)
        | StateEvent::ProfilerObserved(ProfilerState::Running) => ServerState::Profiling,
        StateEvent::ProfilerObserved(ProfilerState::Inactive) => ServerState::Stopped,
        StateEvent::DebuggerChanged { suspended: true } => ServerState::Suspended,
        StateEvent::DebuggerChanged { suspended: false } => ServerState::Debugging,
    }
}

/// Cached backend handles, cleared as one unit by `reset()`
#[derive(Default)]
struct HandleCache {
    manager: Option<Arc<dyn DeploymentManager>>,
    disconnected_manager: Option<Arc<dyn DeploymentManager>>,
    start_control: Option<Arc<dyn StartControl>>,
    incremental: Option<Arc<dyn IncrementalDeployment>>,
    resolver: Option<Arc<dyn TargetModuleResolver>>,
    targets: Option<Vec<TargetRef>>,
    co_target: Option<TargetRef>,
}

/// Result cache for the running probe
struct RunningCheck {
    last_check: Option<Instant>,
    is_running: bool,
}

/// What this process started, so removal can stop it again
#[derive(Default)]
struct StartedFlags {
    manager_started_by_runner: bool,
    targets_started_by_runner: HashSet<String>,
}

/// One configured server instance and its lifecycle state machine.
///
/// Identity is the connection URL. Instances are created through
/// [`ServerRegistry::add_instance`](crate::registry::ServerRegistry::add_instance)
/// and always live behind an `Arc`.
pub struct ServerInstance {
    url: String,
    config: InstanceConfig,
    tuning: TuningConfig,
    plugin: Arc<dyn ServerPlugin>,
    registry: Weak<ServerRegistry>,
    state: Mutex<ServerState>,
    state_events: broadcast::Sender<StateChange>,
    manager_events: broadcast::Sender<()>,
    handles: Mutex<HandleCache>,
    running_check: Mutex<RunningCheck>,
    debug_info: Mutex<HashMap<Option<String>, DebugInfo>>,
    started: Mutex<StartedFlags>,
}

impl ServerInstance {
    pub(crate) fn new(
        url: String,
        config: InstanceConfig,
        tuning: TuningConfig,
        plugin: Arc<dyn ServerPlugin>,
        registry: Weak<ServerRegistry>,
    ) -> Self {
        let (state_events, _) = broadcast::channel(64);
        let (manager_events, _) = broadcast::channel(16);
        Self {
            url,
            config,
            tuning,
            plugin,
            registry,
            state: Mutex::new(ServerState::Stopped),
            state_events,
            manager_events,
            handles: Mutex::new(HandleCache::default()),
            running_check: Mutex::new(RunningCheck {
                last_check: None,
                is_running: false,
            }),
            debug_info: Mutex::new(HashMap::new()),
            started: Mutex::new(StartedFlags::default()),
        }
    }

    /// Connection URL, the identity of this instance
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Display name shown in progress and error messages
    pub fn display_name(&self) -> &str {
        self.config.display_name.as_deref().unwrap_or(&self.url)
    }

    /// Instance configuration
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Deployment session timeout configured for this instance
    pub fn deployment_timeout(&self) -> Duration {
        self.config.deployment_timeout()
    }

    /// Tuning knobs shared with the schedulers
    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    // ---------- state & listeners ----------

    /// Last known lifecycle state
    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Subscribe to state transitions
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_events.subscribe()
    }

    /// Subscribe to manager-change notifications fired when cached backend
    /// handles are created or dropped
    pub fn subscribe_manager_changes(&self) -> broadcast::Receiver<()> {
        self.manager_events.subscribe()
    }

    /// Apply a state event. This is the only place the lifecycle state is
    /// written.
    fn apply_state_event(&self, event: StateEvent) {
        let new = next_state(event);
        let old = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            tracing::debug!(instance = %self.url, from = %old, to = %new, ?event, "Server state changed");
            let _ = self.state_events.send(StateChange { old, new });
        }
    }

    /// External debugger integration: the attached debugger suspended or
    /// resumed the server. Drives `Suspended`/`Debugging` without a full
    /// refresh cycle.
    pub fn notify_debugger_state_changed(&self, suspended: bool) {
        self.apply_state_event(StateEvent::DebuggerChanged { suspended });
    }

    // ---------- backend handle caches ----------

    /// The connected deployment manager, created on first use
    pub async fn deployment_manager(&self) -> Result<Arc<dyn DeploymentManager>> {
        if let Some(manager) = self.handles.lock().expect("handle lock poisoned").manager.clone()
        {
            return Ok(manager);
        }
        let manager = self
            .plugin
            .deployment_manager(&self.url, &self.config.properties)
            .await?;
        {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            handles.manager = Some(Arc::clone(&manager));
        }
        let _ = self.manager_events.send(());
        Ok(manager)
    }

    /// Whether a connected deployment manager is cached
    pub fn is_connected(&self) -> bool {
        self.handles
            .lock()
            .expect("handle lock poisoned")
            .manager
            .is_some()
    }

    /// The disconnected deployment manager; never requires a running server
    pub async fn disconnected_manager(&self) -> Result<Arc<dyn DeploymentManager>> {
        if let Some(manager) = self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .disconnected_manager
            .clone()
        {
            return Ok(manager);
        }
        let manager = self.plugin.disconnected_manager(&self.url).await?;
        let fire = {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            let fire = handles.manager.is_none();
            handles.disconnected_manager = Some(Arc::clone(&manager));
            fire
        };
        if fire {
            let _ = self.manager_events.send(());
        }
        Ok(manager)
    }

    /// The lifecycle-control capability, if the plugin provides one
    pub async fn start_control(&self) -> Option<Arc<dyn StartControl>> {
        if let Some(control) = self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .start_control
            .clone()
        {
            return Some(control);
        }
        let manager = match self.disconnected_manager().await {
            Ok(manager) => manager,
            Err(e) => {
                tracing::info!(instance = %self.url, error = %e, "No disconnected manager available");
                return None;
            }
        };
        let control = self.plugin.start_control(&manager);
        if let Some(control) = &control {
            self.handles
                .lock()
                .expect("handle lock poisoned")
                .start_control = Some(Arc::clone(control));
        }
        control
    }

    /// The incremental (file-based) deployment capability, if provided.
    ///
    /// Requires a connected deployment manager.
    pub async fn incremental_deployment(&self) -> Result<Option<Arc<dyn IncrementalDeployment>>> {
        if let Some(incremental) = self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .incremental
            .clone()
        {
            return Ok(Some(incremental));
        }
        let manager = self.deployment_manager().await?;
        let incremental = self.plugin.incremental_deployment(&manager);
        if let Some(incremental) = &incremental {
            self.handles.lock().expect("handle lock poisoned").incremental =
                Some(Arc::clone(incremental));
        }
        Ok(incremental)
    }

    /// The shared-module-identity resolver capability, if provided
    pub async fn module_resolver(&self) -> Result<Option<Arc<dyn TargetModuleResolver>>> {
        if let Some(resolver) = self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .resolver
            .clone()
        {
            return Ok(Some(resolver));
        }
        let manager = self.deployment_manager().await?;
        let resolver = self.plugin.module_resolver(&manager);
        if let Some(resolver) = &resolver {
            self.handles.lock().expect("handle lock poisoned").resolver =
                Some(Arc::clone(resolver));
        }
        Ok(resolver)
    }

    // ---------- datasources & message destinations ----------

    /// Data sources deployed on this instance; empty when the plugin has no
    /// data source administration capability
    pub async fn datasources(&self) -> Result<Vec<crate::plugin::Datasource>> {
        let manager = self.disconnected_manager().await?;
        match self.plugin.datasource_manager(&manager) {
            Some(ds_manager) => ds_manager.datasources().await,
            None => Ok(Vec::new()),
        }
    }

    /// Deploy module-defined data sources to this instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] from the plugin for malformed data
    /// source definitions.
    pub async fn deploy_datasources(
        &self,
        datasources: &[crate::plugin::Datasource],
    ) -> Result<()> {
        if datasources.is_empty() {
            return Ok(());
        }
        let manager = self.deployment_manager().await?;
        match self.plugin.datasource_manager(&manager) {
            Some(ds_manager) => ds_manager.deploy_datasources(datasources).await,
            None => Ok(()),
        }
    }

    /// Message destinations configured on this instance; empty when the
    /// plugin has no message destination capability
    pub async fn message_destinations(&self) -> Result<Vec<crate::plugin::MessageDestination>> {
        let manager = self.disconnected_manager().await?;
        match self.plugin.message_destination_deployment(&manager) {
            Some(deployment) => deployment.message_destinations().await,
            None => Ok(Vec::new()),
        }
    }

    /// Deploy module-defined message destinations to this instance
    pub async fn deploy_message_destinations(
        &self,
        destinations: &[crate::plugin::MessageDestination],
    ) -> Result<()> {
        if destinations.is_empty() {
            return Ok(());
        }
        let manager = self.deployment_manager().await?;
        match self.plugin.message_destination_deployment(&manager) {
            Some(deployment) => deployment.deploy_message_destinations(destinations).await,
            None => Ok(()),
        }
    }

    /// Drop every cached backend handle and notify dependents.
    ///
    /// The released connected manager is told so through
    /// [`DeploymentManager::release`].
    pub fn reset(&self) {
        let manager = {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            let manager = handles.manager.take();
            *handles = HandleCache::default();
            manager
        };
        let _ = self.manager_events.send(());
        if let Some(manager) = manager {
            manager.release();
        }
    }

    // ---------- running / debuggable / suspended probes ----------

    /// Whether the server is running; cached for a short window to bound
    /// plugin-call overhead
    pub async fn is_running(&self) -> bool {
        self.is_running_within(self.tuning.running_check_cache())
            .await
    }

    /// Running probe that bypasses the cache; use before state-changing
    /// operations where precision matters
    pub async fn is_really_running(&self) -> bool {
        self.is_running_within(Duration::ZERO).await
    }

    async fn is_running_within(&self, window: Duration) -> bool {
        {
            let check = self.running_check.lock().expect("running check lock poisoned");
            if let Some(last) = check.last_check {
                if last.elapsed() < window {
                    return check.is_running;
                }
            }
        }
        let running = match self.start_control().await {
            Some(control) => {
                safe_probe(control.is_running(None), RUNNING_CHECK_TIMEOUT).await
            }
            None => false,
        };
        let mut check = self.running_check.lock().expect("running check lock poisoned");
        check.is_running = running;
        check.last_check = Some(Instant::now());
        running
    }

    /// Result of the last running probe without touching the plugin
    pub fn is_running_last_check(&self) -> bool {
        let check = self.running_check.lock().expect("running check lock poisoned");
        check.last_check.is_some() && check.is_running
    }

    /// Whether a debugger could attach to the server (or a target)
    pub async fn is_debuggable(&self, target: Option<&TargetRef>) -> bool {
        match self.start_control().await {
            Some(control) => {
                safe_probe(control.is_debuggable(target), DEBUGGING_CHECK_TIMEOUT).await
            }
            None => false,
        }
    }

    /// Whether the attached debugger has the server suspended
    pub async fn is_suspended(&self) -> bool {
        match self.start_control().await {
            Some(control) => safe_probe(control.is_suspended(), DEBUGGING_CHECK_TIMEOUT).await,
            None => false,
        }
    }

    /// Whether this server can be started in debug mode at all
    pub async fn is_debug_supported(&self) -> bool {
        match self.start_control().await {
            Some(control) => {
                control.supports_start_debugging(None) || control.is_debuggable(None).await
            }
            None => false,
        }
    }

    /// Whether the plugin can start this server in debug mode
    pub async fn is_debug_start_supported(&self) -> bool {
        match self.start_control().await {
            Some(control) => control.supports_start_debugging(None),
            None => false,
        }
    }

    /// Whether this server can be started under a profiler
    pub async fn is_profile_supported(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        if registry.profiler().is_none() {
            return false;
        }
        match self.start_control().await {
            Some(control) => control.supports_start_profiling(None),
            None => false,
        }
    }

    /// Whether the plugin can start and stop the admin server
    pub async fn can_start_server(&self) -> bool {
        match self.start_control().await {
            Some(control) => control.supports_start_deployment_manager(),
            None => false,
        }
    }

    // ---------- targets ----------

    /// Targets administered by this instance.
    ///
    /// May start the admin server as a side effect when the plugin needs a
    /// running server to enumerate targets.
    pub async fn targets(self: &Arc<Self>) -> Result<Vec<TargetRef>> {
        if let Some(targets) = self
            .handles
            .lock()
            .expect("handle lock poisoned")
            .targets
            .clone()
        {
            if !targets.is_empty() {
                return Ok(targets);
            }
        }

        if let Some(control) = self.start_control().await {
            if !self.is_running().await && control.needs_start_for_target_list() {
                let profiler_active = self
                    .registry
                    .upgrade()
                    .and_then(|r| r.profiler())
                    .map(|p| p.state() != ProfilerState::Inactive)
                    .unwrap_or(false);
                if !profiler_active {
                    self.start_silent().await;
                }
            }
        }

        let manager = self.deployment_manager().await?;
        let targets = manager.targets().await.unwrap_or_else(|e| {
            tracing::info!(instance = %self.url, error = %e, "Target enumeration failed");
            Vec::new()
        });
        self.handles.lock().expect("handle lock poisoned").targets = Some(targets.clone());
        Ok(targets)
    }

    /// Find a target by name
    pub async fn server_target(self: &Arc<Self>, name: &str) -> Option<TargetRef> {
        self.targets()
            .await
            .ok()?
            .into_iter()
            .find(|t| t.name == name)
    }

    /// Whether this instance administers the given target
    pub async fn is_manager_of(self: &Arc<Self>, target: &TargetRef) -> bool {
        self.targets()
            .await
            .map(|targets| targets.iter().any(|t| t.name == target.name))
            .unwrap_or(false)
    }

    /// The target co-located with the admin server, when known
    pub fn co_target(&self) -> Option<TargetRef> {
        self.handles
            .lock()
            .expect("handle lock poisoned")
            .co_target
            .clone()
    }

    async fn init_co_target(self: &Arc<Self>) {
        let Some(control) = self.start_control().await else {
            return;
        };
        let Ok(targets) = self.targets().await else {
            return;
        };
        for target in &targets {
            if control.is_also_target_server(Some(target)) {
                self.handles.lock().expect("handle lock poisoned").co_target =
                    Some(target.clone());
            }
        }
    }

    /// Targets this process started, by name
    pub fn targets_started_by_runner(&self) -> Vec<String> {
        self.started
            .lock()
            .expect("started lock poisoned")
            .targets_started_by_runner
            .iter()
            .cloned()
            .collect()
    }

    // ---------- refresh ----------

    /// Recompute the lifecycle state from backend and profiler probes.
    ///
    /// Runs after every transition attempt; the safety catch guarantees the
    /// instance is never left in `Waiting`.
    pub async fn refresh(self: &Arc<Self>) {
        let old_state = self.state();
        self.apply_state_event(StateEvent::TransitionStarted);

        let profiled_here = self
            .registry
            .upgrade()
            .map(|r| r.is_profiled(&self.url))
            .unwrap_or(false);
        if profiled_here {
            self.update_state_from_profiler().await;
        } else {
            let suspended = self.is_suspended().await;
            let debuggable = !suspended && self.is_debuggable(None).await;
            let running = !suspended && !debuggable && self.is_really_running().await;

            if !suspended {
                // dropping cached handles right after a suspension could
                // freeze on the still unresponsive server, skip that reset
                if !(debuggable && old_state == ServerState::Suspended) {
                    self.reset();
                }
                if debuggable || running {
                    self.init_co_target().await;
                }
            }
            self.apply_state_event(StateEvent::Probed {
                suspended,
                debuggable,
                running,
            });
        }

        // safety catch - make sure that we are not still waiting
        if self.state() == ServerState::Waiting {
            self.apply_state_event(StateEvent::Probed {
                suspended: false,
                debuggable: false,
                running: false,
            });
        }
    }

    /// Run `refresh()` in the background
    pub fn refresh_in_background(self: &Arc<Self>) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            instance.refresh().await;
        });
    }

    async fn update_state_from_profiler(self: &Arc<Self>) {
        let profiler_state = self
            .registry
            .upgrade()
            .and_then(|r| r.profiler())
            .map(|p| p.state())
            .unwrap_or(ProfilerState::Inactive);
        if matches!(
            profiler_state,
            ProfilerState::Profiling | ProfilerState::Running
        ) && self.is_really_running().await
        {
            self.init_co_target().await;
        }
        self.apply_state_event(StateEvent::ProfilerObserved(profiler_state));
    }

    // ---------- debug info ----------

    /// Cached debug attach information for a target
    pub fn cached_debug_info(&self, target: Option<&TargetRef>) -> Option<DebugInfo> {
        self.debug_info
            .lock()
            .expect("debug info lock poisoned")
            .get(&target.map(|t| t.name.clone()))
            .cloned()
    }

    async fn retrieve_debug_info(self: &Arc<Self>, target: Option<&TargetRef>) -> Option<DebugInfo> {
        let control = self.start_control().await?;
        let resolved = self.retrieve_target(target).await;
        let info = control.debug_info(resolved.as_ref()).await;
        if let Some(info) = &info {
            self.debug_info
                .lock()
                .expect("debug info lock poisoned")
                .insert(resolved.map(|t| t.name), info.clone());
        }
        info
    }

    /// Resolve the target an operation applies to: the explicit one, the
    /// co-located target, or the first known target.
    async fn retrieve_target(self: &Arc<Self>, target: Option<&TargetRef>) -> Option<TargetRef> {
        if let Some(target) = target {
            return Some(target.clone());
        }
        let control = self.start_control().await?;

        if !self.is_really_running().await && control.needs_start_for_target_list() {
            // enumeration would force a server start here; fall back to
            // whatever was cached earlier
            let handles = self.handles.lock().expect("handle lock poisoned");
            return handles
                .co_target
                .clone()
                .or_else(|| handles.targets.as_ref().and_then(|t| t.first().cloned()));
        }

        let targets = self.targets().await.ok()?;
        for candidate in &targets {
            if control.is_also_target_server(Some(candidate)) {
                return Some(candidate.clone());
            }
        }
        targets.first().cloned()
    }

    // ---------- conflicts ----------

    /// Find another registered instance already debugging on the same
    /// transport (socket host and port, or shared memory name).
    pub async fn another_server_debuggable(
        self: &Arc<Self>,
        target: Option<&TargetRef>,
    ) -> Option<ConflictData> {
        if self.start_control().await.is_none() {
            return None;
        }
        let this_info = match self.cached_debug_info(target) {
            Some(info) => info,
            None => match self.retrieve_debug_info(target).await {
                Some(info) => info,
                None => {
                    tracing::debug!(instance = %self.url, "No debug info available for conflict check");
                    return None;
                }
            },
        };

        let registry = self.registry.upgrade()?;
        for other in registry.instances() {
            if other.url().eq_ignore_ascii_case(&self.url) {
                continue;
            }
            if !other.is_debuggable(None).await {
                continue;
            }
            let other_target = other.retrieve_target(None).await;
            let Some(other_info) = other.cached_debug_info(other_target.as_ref()) else {
                continue;
            };
            if this_info.conflicts_with(&other_info) {
                return Some(ConflictData::new(Arc::clone(&other), this_info));
            }
        }
        None
    }

    async fn resolve_server_conflict(
        self: &Arc<Self>,
        sink: &dyn ProgressSink,
        conflict: ConflictData,
    ) -> Result<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::Other("Server registry dropped".to_string()))?;
        if !registry
            .conflict_resolver()
            .resolve_debugger_conflict(&conflict)
        {
            return Err(Error::Server(format!(
                "Startup of {} cancelled, debug transport occupied by {}",
                self.display_name(),
                conflict.instance().display_name()
            )));
        }
        let other = Arc::clone(conflict.instance());
        let other_supports_stop = match other.start_control().await {
            Some(control) => control.supports_start_deployment_manager(),
            None => false,
        };
        if !other_supports_stop {
            return Err(Error::Server(format!(
                "Cannot stop {}, its plugin does not control the server process",
                other.display_name()
            )));
        }
        other.stop(sink).await
    }

    // ---------- public transitions ----------

    /// Start the admin server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the server cannot be started.
    pub async fn start(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self.start_target_mode(None, sink, StartMode::Run).await;
        self.refresh().await;
        result
    }

    /// Start the admin server in debug mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the server cannot be started.
    pub async fn start_debug(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self.start_target_mode(None, sink, StartMode::Debug).await;
        if result.is_ok() {
            self.retrieve_debug_info(None).await;
        }
        self.refresh().await;
        result
    }

    /// Start the admin server in profile mode.
    ///
    /// At most one instance process-wide may profile; a second profiling
    /// start goes through the registry's conflict resolver and stops the
    /// first instance only when the resolver accepts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if profiling cannot be started or the
    /// conflict was not resolved.
    pub async fn start_profile(
        self: &Arc<Self>,
        force_restart: bool,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::Other("Server registry dropped".to_string()))?;
        if let Some(profiled_url) = registry.profiled_url() {
            if profiled_url != self.url {
                let display = registry
                    .instance(&profiled_url)
                    .map(|i| i.display_name().to_string())
                    .unwrap_or(profiled_url.clone());
                if !registry
                    .conflict_resolver()
                    .resolve_profiler_conflict(&display)
                {
                    return Err(Error::Server(format!(
                        "Profiling of {} cancelled, {} is already being profiled",
                        self.display_name(),
                        display
                    )));
                }
            }
        }
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self.start_profile_inner(None, force_restart, sink).await;
        self.refresh().await;
        result
    }

    /// Restart the admin server in the mode it was running in before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the server cannot be restarted.
    pub async fn restart(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self.restart_inner(sink).await;
        self.refresh().await;
        result
    }

    async fn restart_inner(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        let in_debug = self.is_debuggable(None).await;
        let in_profile = self
            .registry
            .upgrade()
            .map(|r| r.is_profiled(&self.url))
            .unwrap_or(false);

        if in_profile || self.is_really_running().await || self.is_suspended().await {
            self.stop_inner(sink).await?;
        }
        if in_profile {
            self.start_profile_inner(None, true, sink).await
        } else if in_debug {
            let result = self.start_target_mode(None, sink, StartMode::Debug).await;
            if result.is_ok() {
                self.retrieve_debug_info(None).await;
            }
            result
        } else {
            self.start_target_mode(None, sink, StartMode::Run).await
        }
    }

    /// Stop the admin server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the server cannot be stopped.
    pub async fn stop(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = async {
            let profiled = self
                .registry
                .upgrade()
                .map(|r| r.is_profiled(&self.url))
                .unwrap_or(false);
            if profiled || self.is_really_running().await || self.is_suspended().await {
                self.stop_inner(sink).await?;
            }
            self.debug_info
                .lock()
                .expect("debug info lock poisoned")
                .clear();
            Ok(())
        }
        .await;
        self.refresh().await;
        result
    }

    /// Start a specific target. When the target is also the admin server
    /// this only makes sure the admin server is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the target cannot be started.
    pub async fn start_target(
        self: &Arc<Self>,
        target: &TargetRef,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self
            .start_target_mode(Some(target), sink, StartMode::Run)
            .await;
        self.refresh().await;
        result
    }

    /// Start a specific target in debug mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the target cannot be started.
    pub async fn start_debug_target(
        self: &Arc<Self>,
        target: &TargetRef,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        self.apply_state_event(StateEvent::TransitionStarted);
        let result = self
            .start_target_mode(Some(target), sink, StartMode::Debug)
            .await;
        if result.is_ok() {
            self.retrieve_debug_info(Some(target)).await;
        }
        self.refresh().await;
        result
    }

    /// Stop the server if this process started it, do nothing otherwise.
    /// Used on instance removal and shutdown; failures are logged.
    pub async fn stop_if_started_by_runner(self: &Arc<Self>) {
        let manager_started = self
            .started
            .lock()
            .expect("started lock poisoned")
            .manager_started_by_runner;
        if !manager_started {
            return;
        }

        if let Some(control) = self.start_control().await {
            if control.can_stop_silently() {
                control.stop_silently().await;
                return;
            }
        }

        let sink = LogProgressSink;
        for name in self.targets_started_by_runner() {
            if let Some(target) = self.server_target(&name).await {
                if let Err(e) = self.stop_target_inner(&target, &sink).await {
                    tracing::info!(instance = %self.url, target = %name, error = %e, "Failed to stop target on removal");
                }
            }
        }
        if self.is_really_running().await || self.is_suspended().await {
            if let Err(e) = self.stop_inner(&sink).await {
                tracing::info!(instance = %self.url, error = %e, "Failed to stop server on removal");
            }
        }
    }

    /// Start the admin server with log-only progress, ignoring failures.
    /// Used where an operation needs a running admin server as a side
    /// effect (target enumeration, admin configuration).
    fn start_silent(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // boxed to break the async cycle targets -> start -> targets
        Box::pin(async move {
            if self.is_running().await {
                return;
            }
            let sink = LogProgressSink;
            if let Err(e) = self.start(&sink).await {
                tracing::info!(instance = %self.url, error = %e, "Background server start failed");
            }
        })
    }

    // ---------- the multiplexer ----------

    /// Core multiplexing logic for every run/debug start request.
    async fn start_target_mode(
        self: &Arc<Self>,
        target: Option<&TargetRef>,
        sink: &dyn ProgressSink,
        mode: StartMode,
    ) -> Result<()> {
        let Some(control) = self.start_control().await else {
            // no start control, have to assume the server is started manually
            sink.progress(&format!(
                "Plugin of {} provides no start control, assuming a manually started server",
                self.display_name()
            ));
            return Ok(());
        };
        if self.is_suspended().await {
            return Err(Error::Server(format!(
                "{} is suspended in the debugger, resume or stop the debugger session first",
                self.display_name()
            )));
        }

        let can_control_admin = control.supports_start_deployment_manager();
        let can_debug = control.supports_start_debugging(target);
        let needs_restart = control.needs_restart(target);

        if control.is_also_target_server(target) {
            match mode {
                StartMode::Debug => {
                    if control.is_debuggable(target).await {
                        // already running in debug mode
                        if !needs_restart {
                            return Ok(());
                        }
                        if !can_control_admin || !can_debug {
                            return Err(Error::Server(format!(
                                "Restarting {} is not supported by its plugin",
                                self.display_name()
                            )));
                        }
                        self.stop_inner(sink).await?;
                    } else if self.is_really_running().await {
                        // running but not debuggable
                        if !can_control_admin || !can_debug {
                            return Err(Error::Server(format!(
                                "Starting {} in debug mode is not supported by its plugin",
                                self.display_name()
                            )));
                        }
                        self.stop_inner(sink).await?;
                    }
                    // the server is stopped now
                    if !can_debug {
                        return Err(Error::Server(format!(
                            "Starting {} in debug mode is not supported by its plugin",
                            self.display_name()
                        )));
                    }
                    if let Some(conflict) = self.another_server_debuggable(target).await {
                        self.resolve_server_conflict(sink, conflict).await?;
                    }
                    self.start_debug_inner(target, sink).await
                }
                StartMode::Run => {
                    if self.is_really_running().await {
                        if !needs_restart {
                            return Ok(());
                        }
                        if !can_control_admin {
                            return Err(Error::Server(format!(
                                "Restarting {} is not supported by its plugin",
                                self.display_name()
                            )));
                        }
                        self.stop_inner(sink).await?;
                    }
                    if !can_control_admin {
                        return Err(Error::Server(format!(
                            "Starting {} is not supported by its plugin",
                            self.display_name()
                        )));
                    }
                    self.start_inner(sink).await
                }
            }
        } else {
            // ensure a running admin server before controlling sub-targets
            if !self.is_really_running().await {
                if !can_control_admin {
                    return Err(Error::Server(format!(
                        "Starting {} is not supported by its plugin",
                        self.display_name()
                    )));
                }
                self.start_inner(sink).await?;
            }
            let target = target.ok_or_else(|| {
                Error::Other("Sub-target start requested without a target".to_string())
            })?;
            match mode {
                StartMode::Debug => {
                    if control.is_debuggable(Some(target)).await {
                        if !needs_restart {
                            return Ok(());
                        }
                        self.stop_target_inner(target, sink).await?;
                    } else if control.is_running(Some(target)).await {
                        self.stop_target_inner(target, sink).await?;
                    }
                    if let Some(conflict) = self.another_server_debuggable(Some(target)).await {
                        self.resolve_server_conflict(sink, conflict).await?;
                    }
                    self.start_debug_inner(Some(target), sink).await
                }
                StartMode::Run => {
                    if control.is_running(Some(target)).await {
                        if !needs_restart {
                            return Ok(());
                        }
                        self.stop_target_inner(target, sink).await?;
                    }
                    self.start_target_inner(target, sink).await
                }
            }
        }
    }

    // ---------- atomic transition operations ----------
    // these always perform the operation without re-checking state

    async fn start_inner(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        let control = self.require_start_control().await?;
        let handle = control.start_deployment_manager().await?;
        self.track_lifecycle(handle, sink, self.config.startup_timeout(), "Starting")
            .await?;
        {
            let mut started = self.started.lock().expect("started lock poisoned");
            started.manager_started_by_runner = true;
        }
        {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            handles.co_target = None;
            handles.targets = None;
        }
        self.init_co_target().await;
        Ok(())
    }

    async fn start_debug_inner(
        self: &Arc<Self>,
        target: Option<&TargetRef>,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let control = self.require_start_control().await?;
        let handle = control.start_debugging(target).await?;
        self.track_lifecycle(
            handle,
            sink,
            self.config.startup_timeout(),
            "Starting in debug mode",
        )
        .await?;
        {
            let mut started = self.started.lock().expect("started lock poisoned");
            started.manager_started_by_runner = true;
        }
        {
            let mut handles = self.handles.lock().expect("handle lock poisoned");
            handles.co_target = None;
            handles.targets = None;
        }
        self.init_co_target().await;
        Ok(())
    }

    async fn start_profile_inner(
        self: &Arc<Self>,
        target: Option<&TargetRef>,
        force_restart: bool,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::Other("Server registry dropped".to_string()))?;

        let profiled = registry.profiled_url();
        if profiled.as_deref() == Some(self.url.as_str()) && !force_restart {
            // already running in profile mode, no need to restart
            return Ok(());
        }
        if let Some(other_url) = profiled {
            if other_url != self.url {
                if let Some(other) = registry.instance(&other_url) {
                    other.stop(sink).await?;
                }
                registry.clear_profiled(&other_url);
            }
        }
        if registry.is_profiled(&self.url)
            || self.is_really_running().await
            || self.is_debuggable(target).await
        {
            self.stop_inner(sink).await?;
            self.debug_info
                .lock()
                .expect("debug info lock poisoned")
                .clear();
        }

        let profiler = registry.profiler().ok_or_else(|| {
            Error::Server("No profiler is registered with the server registry".to_string())
        })?;
        profiler.notify_starting();
        self.spawn_profiler_poller();

        let control = self.require_start_control().await?;
        let handle = control.start_profiling(target).await?;
        self.track_lifecycle(
            handle,
            sink,
            self.config.startup_timeout(),
            "Starting in profile mode",
        )
        .await?;

        registry.set_profiled(&self.url);
        self.started
            .lock()
            .expect("started lock poisoned")
            .manager_started_by_runner = true;
        Ok(())
    }

    /// Poll the profiler state while the profiling session lives and clear
    /// the registry slot once the instance stops.
    fn spawn_profiler_poller(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let url = self.url.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROFILER_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(instance) = weak.upgrade() else {
                    break;
                };
                if instance.state() == ServerState::Stopped {
                    if let Some(registry) = instance.registry.upgrade() {
                        registry.clear_profiled(&url);
                    }
                    break;
                }
                let profiled = instance
                    .registry
                    .upgrade()
                    .map(|r| r.is_profiled(&url))
                    .unwrap_or(false);
                if profiled {
                    instance.update_state_from_profiler().await;
                }
            }
        });
    }

    async fn shutdown_profiler(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        sink.progress("Stopping the profiler");
        let profiler = self.registry.upgrade().and_then(|r| r.profiler());
        if let Some(profiler) = profiler {
            let handle = profiler.shutdown().await;
            self.track_lifecycle(
                handle,
                sink,
                self.config.shutdown_timeout(),
                "Profiler shutdown",
            )
            .await?;
        }
        Ok(())
    }

    async fn stop_inner(self: &Arc<Self>, sink: &dyn ProgressSink) -> Result<()> {
        let registry = self.registry.upgrade();
        if let Some(registry) = &registry {
            if registry.is_profiled(&self.url) {
                // detach the profiler before stopping the process under it
                self.shutdown_profiler(sink).await?;
                registry.clear_profiled(&self.url);
            }
        }

        let control = self.require_start_control().await?;
        let handle = control.stop_deployment_manager().await?;
        self.track_lifecycle(handle, sink, self.config.shutdown_timeout(), "Stopping")
            .await?;
        self.started
            .lock()
            .expect("started lock poisoned")
            .manager_started_by_runner = false;
        self.reset();
        Ok(())
    }

    async fn start_target_inner(
        self: &Arc<Self>,
        target: &TargetRef,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let control = self.require_start_control().await?;
        if control.is_running(Some(target)).await {
            return Ok(());
        }
        let handle = control.start_target(target).await?;
        self.track_lifecycle(handle, sink, self.config.startup_timeout(), "Starting")
            .await?;
        self.started
            .lock()
            .expect("started lock poisoned")
            .targets_started_by_runner
            .insert(target.name.clone());
        Ok(())
    }

    async fn stop_target_inner(
        self: &Arc<Self>,
        target: &TargetRef,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let control = self.require_start_control().await?;
        if !control.is_running(Some(target)).await {
            return Ok(());
        }
        let handle = control.stop_target(target).await?;
        self.track_lifecycle(handle, sink, self.config.shutdown_timeout(), "Stopping")
            .await?;
        self.started
            .lock()
            .expect("started lock poisoned")
            .targets_started_by_runner
            .remove(&target.name);
        Ok(())
    }

    async fn require_start_control(&self) -> Result<Arc<dyn StartControl>> {
        self.start_control().await.ok_or_else(|| {
            Error::Server(format!(
                "Plugin of {} provides no start control",
                self.display_name()
            ))
        })
    }

    /// Track a lifecycle progress operation, mapping failure and timeout
    /// into user-facing server errors.
    async fn track_lifecycle(
        &self,
        handle: ProgressHandle,
        sink: &dyn ProgressSink,
        timeout: Duration,
        what: &str,
    ) -> Result<()> {
        match track_progress(
            handle.clone(),
            sink,
            timeout,
            self.tuning.progress_poll_interval(),
        )
        .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Server(handle.status().message)),
            Err(Error::Timeout(_)) => Err(Error::Server(format!(
                "{} {} did not finish within the timeout",
                what,
                self.display_name()
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Bound a plugin probe; a probe that blocks past the timeout reports
/// `false` rather than wedging the caller.
async fn safe_probe<F>(probe: F, timeout: Duration) -> bool
where
    F: Future<Output = bool> + Send,
{
    tokio::time::timeout(timeout, probe).await.unwrap_or(false)
}
