//! Shared test doubles: an in-memory backend plugin and a module provider
//! backed by a real directory tree.

#![allow(dead_code)]

use async_trait::async_trait;
use deploy_runner::config::{InstanceConfig, TuningConfig};
use deploy_runner::deploy::{ModuleDescriptors, ModuleEntry, ModuleProvider};
use deploy_runner::error::Result;
use deploy_runner::plugin::{
    DebugInfo, DeploymentContent, DeploymentManager, IncrementalDeployment, ModuleKind,
    ModuleQuery, ModuleRef, ModuleSpec, PluginRegistry, Profiler, ProfilerState, ProgressHandle,
    ServerPlugin, StartControl, TargetModuleResolver, TargetRef,
};
use deploy_runner::registry::ServerRegistry;
use deploy_runner::AppChanges;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared state of one mock server, inspected by tests
#[derive(Default)]
pub struct MockState {
    pub running: AtomicBool,
    pub debuggable: AtomicBool,
    pub suspended: AtomicBool,
    pub can_control: AtomicBool,
    pub can_debug: AtomicBool,
    pub can_profile: AtomicBool,
    pub needs_restart: AtomicBool,
    pub file_deploy: AtomicBool,
    pub deploy_on_save: AtomicBool,
    pub hang_on_start: AtomicBool,

    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub distributes: AtomicUsize,
    pub initial_deploys: AtomicUsize,
    pub incremental_deploys: AtomicUsize,
    pub deploy_on_saves: AtomicUsize,
    pub undeploys: AtomicUsize,
    pub module_starts: AtomicUsize,

    pub targets: Mutex<Vec<TargetRef>>,
    pub available: Mutex<Vec<ModuleRef>>,
    pub debug_info: Mutex<Option<DebugInfo>>,
    pub deploy_dir: Mutex<Option<PathBuf>>,
    pub shared_modules: Mutex<Vec<(String, ModuleRef)>>,
    pub last_deploy_on_save_changes: Mutex<Vec<PathBuf>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        let state = Self::default();
        state.can_control.store(true, Ordering::SeqCst);
        state.can_debug.store(true, Ordering::SeqCst);
        state.file_deploy.store(true, Ordering::SeqCst);
        state.deploy_on_save.store(true, Ordering::SeqCst);
        *state.targets.lock().unwrap() = vec![TargetRef::named("server")];
        Arc::new(state)
    }
}

pub struct MockPlugin {
    pub name: String,
    pub state: Arc<MockState>,
}

impl MockPlugin {
    pub fn named(name: &str, state: &Arc<MockState>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Arc::clone(state),
        })
    }
}

struct MockManager {
    state: Arc<MockState>,
}

struct MockControl {
    state: Arc<MockState>,
}

struct MockIncremental {
    state: Arc<MockState>,
}

struct MockResolver {
    state: Arc<MockState>,
}

#[async_trait]
impl ServerPlugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deployment_manager(
        &self,
        _url: &str,
        _properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn DeploymentManager>> {
        Ok(Arc::new(MockManager {
            state: Arc::clone(&self.state),
        }))
    }

    async fn disconnected_manager(&self, _url: &str) -> Result<Arc<dyn DeploymentManager>> {
        Ok(Arc::new(MockManager {
            state: Arc::clone(&self.state),
        }))
    }

    fn start_control(
        &self,
        _manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn StartControl>> {
        Some(Arc::new(MockControl {
            state: Arc::clone(&self.state),
        }))
    }

    fn incremental_deployment(
        &self,
        _manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn IncrementalDeployment>> {
        Some(Arc::new(MockIncremental {
            state: Arc::clone(&self.state),
        }))
    }

    fn module_resolver(
        &self,
        _manager: &Arc<dyn DeploymentManager>,
    ) -> Option<Arc<dyn TargetModuleResolver>> {
        Some(Arc::new(MockResolver {
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl DeploymentManager for MockManager {
    async fn targets(&self) -> Result<Vec<TargetRef>> {
        Ok(self.state.targets.lock().unwrap().clone())
    }

    async fn available_modules(&self, _targets: &[TargetRef]) -> Result<Vec<ModuleRef>> {
        Ok(self.state.available.lock().unwrap().clone())
    }

    async fn distribute(
        &self,
        targets: &[TargetRef],
        content: &DeploymentContent,
    ) -> Result<ProgressHandle> {
        self.state.distributes.fetch_add(1, Ordering::SeqCst);
        let id = content
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        let mut modules = Vec::new();
        for target in targets {
            let module = ModuleRef {
                id: id.clone(),
                target_name: target.name.clone(),
                web_url: None,
            };
            self.state.available.lock().unwrap().push(module.clone());
            modules.push(module);
        }
        Ok(ProgressHandle::completed_with_modules("distributed", modules))
    }

    async fn redeploy(
        &self,
        modules: &[ModuleRef],
        _content: &DeploymentContent,
    ) -> Result<ProgressHandle> {
        Ok(ProgressHandle::completed_with_modules(
            "redeployed",
            modules.to_vec(),
        ))
    }

    async fn undeploy(&self, modules: &[ModuleRef]) -> Result<ProgressHandle> {
        self.state.undeploys.fetch_add(1, Ordering::SeqCst);
        let mut available = self.state.available.lock().unwrap();
        available.retain(|m| !modules.contains(m));
        Ok(ProgressHandle::completed("undeployed"))
    }

    async fn start_modules(&self, _modules: &[ModuleRef]) -> Result<ProgressHandle> {
        self.state.module_starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProgressHandle::completed("modules started"))
    }

    fn release(&self) {}
}

#[async_trait]
impl StartControl for MockControl {
    async fn is_running(&self, _target: Option<&TargetRef>) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    async fn is_debuggable(&self, _target: Option<&TargetRef>) -> bool {
        self.state.debuggable.load(Ordering::SeqCst)
    }

    async fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::SeqCst)
    }

    fn supports_start_deployment_manager(&self) -> bool {
        self.state.can_control.load(Ordering::SeqCst)
    }

    fn supports_start_debugging(&self, _target: Option<&TargetRef>) -> bool {
        self.state.can_debug.load(Ordering::SeqCst)
    }

    fn supports_start_profiling(&self, _target: Option<&TargetRef>) -> bool {
        self.state.can_profile.load(Ordering::SeqCst)
    }

    fn needs_restart(&self, _target: Option<&TargetRef>) -> bool {
        self.state.needs_restart.load(Ordering::SeqCst)
    }

    async fn start_deployment_manager(&self) -> Result<ProgressHandle> {
        if self.state.hang_on_start.load(Ordering::SeqCst) {
            let (_reporter, handle) = deploy_runner::plugin::progress_channel("hanging");
            // leak the reporter so the handle never settles
            std::mem::forget(_reporter);
            return Ok(handle);
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);
        Ok(ProgressHandle::completed("server started"))
    }

    async fn start_debugging(&self, _target: Option<&TargetRef>) -> Result<ProgressHandle> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);
        self.state.debuggable.store(true, Ordering::SeqCst);
        Ok(ProgressHandle::completed("server started in debug mode"))
    }

    async fn start_profiling(&self, _target: Option<&TargetRef>) -> Result<ProgressHandle> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);
        Ok(ProgressHandle::completed("server started in profile mode"))
    }

    async fn stop_deployment_manager(&self) -> Result<ProgressHandle> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
        self.state.debuggable.store(false, Ordering::SeqCst);
        Ok(ProgressHandle::completed("server stopped"))
    }

    async fn start_target(&self, _target: &TargetRef) -> Result<ProgressHandle> {
        Ok(ProgressHandle::completed("target started"))
    }

    async fn stop_target(&self, _target: &TargetRef) -> Result<ProgressHandle> {
        Ok(ProgressHandle::completed("target stopped"))
    }

    async fn debug_info(&self, _target: Option<&TargetRef>) -> Option<DebugInfo> {
        self.state.debug_info.lock().unwrap().clone()
    }
}

#[async_trait]
impl IncrementalDeployment for MockIncremental {
    fn supports_deploy_on_save(&self) -> bool {
        self.state.deploy_on_save.load(Ordering::SeqCst)
    }

    async fn can_file_deploy(&self, _target: &TargetRef, _module: &ModuleSpec) -> bool {
        self.state.file_deploy.load(Ordering::SeqCst)
    }

    async fn directory_for_new_application(
        &self,
        _target: &TargetRef,
        _module: &ModuleSpec,
    ) -> Option<PathBuf> {
        self.state.deploy_dir.lock().unwrap().clone()
    }

    async fn directory_for_module(&self, _module: &ModuleRef) -> Option<PathBuf> {
        self.state.deploy_dir.lock().unwrap().clone()
    }

    async fn initial_deploy(
        &self,
        target: &TargetRef,
        module: &ModuleSpec,
        _dest: &Path,
    ) -> Result<ProgressHandle> {
        self.state.initial_deploys.fetch_add(1, Ordering::SeqCst);
        let module_ref = ModuleRef {
            id: module.name.clone(),
            target_name: target.name.clone(),
            web_url: module.context_root.clone(),
        };
        self.state
            .available
            .lock()
            .unwrap()
            .push(module_ref.clone());
        Ok(ProgressHandle::completed_with_modules(
            "deployed",
            vec![module_ref],
        ))
    }

    async fn incremental_deploy(
        &self,
        module: &ModuleRef,
        _changes: &AppChanges,
    ) -> Result<ProgressHandle> {
        self.state.incremental_deploys.fetch_add(1, Ordering::SeqCst);
        Ok(ProgressHandle::completed_with_modules(
            "updated",
            vec![module.clone()],
        ))
    }

    async fn deploy_on_save(
        &self,
        module: &ModuleRef,
        changes: &AppChanges,
    ) -> Result<ProgressHandle> {
        self.state.deploy_on_saves.fetch_add(1, Ordering::SeqCst);
        *self.state.last_deploy_on_save_changes.lock().unwrap() =
            changes.changed_files().to_vec();
        Ok(ProgressHandle::completed_with_modules(
            "updated",
            vec![module.clone()],
        ))
    }
}

#[async_trait]
impl TargetModuleResolver for MockResolver {
    async fn lookup(&self, query: &ModuleQuery) -> Result<Vec<ModuleRef>> {
        let shared = self.state.shared_modules.lock().unwrap();
        Ok(shared
            .iter()
            .filter(|(context_root, _)| Some(context_root) == query.context_root.as_ref())
            .map(|(_, module)| module.clone())
            .collect())
    }
}

/// Profiler double with an externally driven state
pub struct MockProfiler {
    pub state: Mutex<ProfilerState>,
}

impl MockProfiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProfilerState::Inactive),
        })
    }
}

#[async_trait]
impl Profiler for MockProfiler {
    fn state(&self) -> ProfilerState {
        *self.state.lock().unwrap()
    }

    fn notify_starting(&self) {
        *self.state.lock().unwrap() = ProfilerState::Starting;
    }

    async fn shutdown(&self) -> ProgressHandle {
        *self.state.lock().unwrap() = ProfilerState::Inactive;
        ProgressHandle::completed("profiler detached")
    }
}

/// Module provider backed by a real directory tree
pub struct DirModule {
    pub name: String,
    pub content_dir: PathBuf,
    pub context_root: Option<String>,
    pub archive_path: Option<PathBuf>,
}

impl ModuleProvider for DirModule {
    fn spec(&self) -> ModuleSpec {
        ModuleSpec {
            name: self.name.clone(),
            kind: ModuleKind::Web,
            context_root: self.context_root.clone(),
            content_dir: Some(self.content_dir.clone()),
            archive_path: self.archive_path.clone(),
        }
    }

    fn descriptors(&self) -> ModuleDescriptors {
        let mut descriptors = ModuleDescriptors::default();
        descriptors
            .descriptor_paths
            .insert(PathBuf::from("WEB-INF/web.xml"));
        descriptors
    }

    fn entries(&self) -> Result<Vec<ModuleEntry>> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&self.content_dir) {
            let entry = entry.map_err(|e| {
                deploy_runner::Error::Distribution(format!("scan failed: {}", e))
            })?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(&self.content_dir)
                    .expect("entry under content dir")
                    .to_path_buf();
                entries.push(ModuleEntry::new(relative, entry.path()));
            }
        }
        Ok(entries)
    }
}

/// Default instance configuration pointing at the mock plugin
pub fn mock_instance_config() -> InstanceConfig {
    InstanceConfig {
        plugin: "mock".to_string(),
        display_name: None,
        startup_timeout_secs: None,
        shutdown_timeout_secs: None,
        deployment_timeout_secs: None,
        properties: HashMap::new(),
    }
}

/// Registry with one mock-backed instance registered under `url`
pub fn registry_with_mock(url: &str, state: &Arc<MockState>) -> Arc<ServerRegistry> {
    let plugins = Arc::new(PluginRegistry::new());
    plugins.register(MockPlugin::named("mock", state));
    let registry = ServerRegistry::new(plugins, TuningConfig::default());
    registry
        .add_instance(url, mock_instance_config())
        .expect("instance registers");
    registry
}

/// Populate a content directory with a small web module
pub fn write_web_module(dir: &Path) {
    std::fs::create_dir_all(dir.join("WEB-INF/classes")).unwrap();
    std::fs::write(dir.join("index.html"), "<html/>").unwrap();
    std::fs::write(dir.join("WEB-INF/web.xml"), "<web-app/>").unwrap();
    std::fs::write(dir.join("WEB-INF/classes/App.class"), "cafebabe").unwrap();
}
