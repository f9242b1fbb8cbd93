//! Per-session deployment orchestration.
//!
//! A [`TargetServer`] drives one module onto a set of targets of one
//! instance: it triages which targets need first-time distribution,
//! incremental redeploy, or undeploy, runs the backend through the correct
//! sequence under one shared deployment deadline, and records the resulting
//! module identities for the next session.

use crate::deploy::distributor::{DiffMode, InitialServerFileDistributor, ServerFileDistributor};
use crate::deploy::{DeploymentState, MissingModulePolicy, ModuleProvider};
use crate::error::{Error, Result};
use crate::instance::{ServerInstance, ServerState};
use crate::module::{TargetModule, TargetModuleStore, now_millis};
use crate::plugin::progress::{ProgressHandle, ProgressSink, track_progress};
use crate::plugin::{
    DeploymentContent, IncrementalDeployment, ModuleQuery, ModuleRef, ModuleSpec, TargetRef,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One deployment session for one module against one instance.
pub struct TargetServer {
    instance: Arc<ServerInstance>,
    provider: Arc<dyn ModuleProvider>,
    targets: Vec<TargetRef>,
    store: Arc<TargetModuleStore>,
    missing_module_policy: MissingModulePolicy,
}

/// Triage outcome computed by `process_last_target_modules`
struct Triage {
    distribute_targets: Vec<TargetRef>,
    redeploy_modules: Vec<TargetModule>,
    undeploy_modules: Vec<ModuleRef>,
}

impl TargetServer {
    /// Create a session for the module on the given targets
    pub fn new(
        instance: Arc<ServerInstance>,
        provider: Arc<dyn ModuleProvider>,
        targets: Vec<TargetRef>,
        store: Arc<TargetModuleStore>,
    ) -> Self {
        Self {
            instance,
            provider,
            targets,
            store,
            missing_module_policy: MissingModulePolicy::RedistributeAll,
        }
    }

    /// Override the policy applied when a previously recorded module is no
    /// longer present on the backend
    pub fn with_missing_module_policy(mut self, policy: MissingModulePolicy) -> Self {
        self.missing_module_policy = policy;
        self
    }

    /// The instance this session deploys to
    pub fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }

    /// Identity path the module's persisted records are keyed by
    fn identity_dir(&self, spec: &ModuleSpec) -> PathBuf {
        spec.content_dir
            .clone()
            .or_else(|| spec.archive_path.clone())
            .unwrap_or_default()
    }

    /// Deploy the module: triage, undeploy stale identities, distribute
    /// first-time targets, incrementally redeploy the rest, and start the
    /// newly distributed modules.
    ///
    /// With no file changes since the last deploy this returns the prior
    /// module records unchanged without touching the backend. Pass
    /// `force_redeploy` to push an update even when the diff is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] when a distribute/redeploy/start operation
    /// fails or times out. Undeploy failures are logged, never propagated;
    /// a failed cleanup must not block the deployment itself.
    #[tracing::instrument(skip(self, sink), fields(instance = %self.instance.url()))]
    pub async fn deploy(
        &self,
        sink: &dyn ProgressSink,
        force_redeploy: bool,
    ) -> Result<Vec<TargetModule>> {
        let deadline = Instant::now() + self.instance.deployment_timeout();
        let spec = self.provider.spec();
        tracing::info!(module = %spec.name, targets = self.targets.len(), "Starting deployment session");

        // the session needs a running admin server
        self.instance.start(sink).await?;
        self.start_targets(sink).await?;
        self.deploy_module_resources(sink).await?;

        let manager = self.instance.deployment_manager().await?;
        let available = manager
            .available_modules(&self.targets)
            .await
            .unwrap_or_else(|e| {
                tracing::info!(error = %e, "Backend module enumeration failed, treating all targets as new");
                Vec::new()
            });

        let mut triage = self.process_last_target_modules(&spec, &available);
        self.check_undeploy_for_shared_references(&mut triage, &spec)
            .await;

        // best-effort cleanup of stale identities
        self.undeploy_stale(&triage.undeploy_modules, sink, deadline)
            .await;

        let mut results: Vec<TargetModule> = Vec::new();
        let mut started_modules: Vec<ModuleRef> = Vec::new();

        if !triage.distribute_targets.is_empty() {
            let distributed = self
                .distribute(&spec, &triage.distribute_targets, sink, deadline)
                .await?;
            for module in &distributed {
                started_modules.push(module.clone());
                let mut record = TargetModule::new(
                    module.id.clone(),
                    self.instance.url(),
                    module.target_name.clone(),
                    now_millis(),
                    self.identity_dir(&spec),
                    spec.context_root.clone().unwrap_or_default(),
                );
                record.resolve(module.clone());
                self.store.write(&record)?;
                results.push(record);
            }
        }

        for record in triage.redeploy_modules {
            let record = self
                .redeploy(&spec, record, force_redeploy, sink, deadline)
                .await?;
            results.push(record);
        }

        // start of newly distributed modules shares the remaining budget
        if !started_modules.is_empty() {
            let handle = manager
                .start_modules(&started_modules)
                .await
                .map_err(|e| Error::Server(format!("Failed to start deployed modules: {}", e)))?;
            self.track_deploy_op(handle, sink, deadline, "Starting deployed modules")
                .await?;
        }

        tracing::info!(modules = results.len(), "Deployment session finished");
        Ok(results)
    }

    /// Make sure every session target is started. Targets co-located with
    /// the admin server are covered by the admin start.
    async fn start_targets(&self, sink: &dyn ProgressSink) -> Result<()> {
        let co_target = self.instance.co_target();
        for target in &self.targets {
            if co_target.as_ref().map(|t| t.name.as_str()) == Some(target.name.as_str()) {
                continue;
            }
            self.instance.start_target(target, sink).await?;
        }
        Ok(())
    }

    /// Deploy the module's data sources and message destinations before its
    /// content, so the application finds its resources on first start.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Configuration`] from the backend for malformed
    /// resource definitions.
    async fn deploy_module_resources(&self, sink: &dyn ProgressSink) -> Result<()> {
        let datasources = self.provider.datasources();
        if !datasources.is_empty() {
            sink.progress("Deploying module data sources");
            self.instance.deploy_datasources(&datasources).await?;
        }
        let destinations = self.provider.message_destinations();
        if !destinations.is_empty() {
            sink.progress("Deploying module message destinations");
            self.instance
                .deploy_message_destinations(&destinations)
                .await?;
        }
        Ok(())
    }

    /// Compare previously recorded modules with what the backend reports and
    /// sort every target into distribute/redeploy/undeploy buckets.
    fn process_last_target_modules(&self, spec: &ModuleSpec, available: &[ModuleRef]) -> Triage {
        let identity = self.identity_dir(spec);
        let context_root = spec.context_root.clone().unwrap_or_default();

        let mut triage = Triage {
            distribute_targets: Vec::new(),
            redeploy_modules: Vec::new(),
            undeploy_modules: Vec::new(),
        };

        for target in &self.targets {
            let records = self.store.read_all(self.instance.url(), &target.name);
            let record = records
                .into_iter()
                .find(|r| r.content_dir() == identity.as_path());

            let Some(mut record) = record else {
                // never deployed here
                triage.distribute_targets.push(target.clone());
                continue;
            };

            let backend_module = available
                .iter()
                .find(|m| m.id == record.id() && m.target_name == target.name);

            match backend_module {
                None => {
                    // recorded but gone from the backend
                    match self.missing_module_policy {
                        MissingModulePolicy::RedistributeAll => {
                            tracing::debug!(target = %target.name, module = %record.id(), "Recorded module missing on backend, redistributing");
                            self.store.remove(&record);
                            triage.distribute_targets.push(target.clone());
                        }
                        MissingModulePolicy::Skip => {
                            tracing::debug!(target = %target.name, module = %record.id(), "Recorded module missing on backend, skipping per policy");
                            self.store.remove(&record);
                        }
                    }
                }
                Some(module) => {
                    if !record.same_reference(&identity, &context_root) {
                        // content dir or context root moved since the last
                        // deployment; in-place update would leave stale state
                        tracing::debug!(target = %target.name, module = %record.id(), "Deployment reference changed, forcing redistribute");
                        triage.undeploy_modules.push(module.clone());
                        self.store.remove(&record);
                        triage.distribute_targets.push(target.clone());
                    } else {
                        record.resolve(module.clone());
                        triage.redeploy_modules.push(record);
                    }
                }
            }
        }
        triage
    }

    /// Ask the backend for other deployed modules claiming the same context
    /// root; anything outside this session's redeploy set is undeployed
    /// first to avoid a context-root collision.
    async fn check_undeploy_for_shared_references(&self, triage: &mut Triage, spec: &ModuleSpec) {
        let Some(context_root) = spec.context_root.clone().filter(|cr| !cr.is_empty()) else {
            return;
        };
        let resolver = match self.instance.module_resolver().await {
            Ok(Some(resolver)) => resolver,
            Ok(None) => return,
            Err(e) => {
                tracing::info!(error = %e, "Module resolver unavailable, skipping shared-reference check");
                return;
            }
        };
        let query = ModuleQuery {
            context_root: Some(context_root),
            module_id: None,
        };
        let sharing = match resolver.lookup(&query).await {
            Ok(sharing) => sharing,
            Err(e) => {
                tracing::info!(error = %e, "Shared-reference lookup failed");
                return;
            }
        };

        let redeploy_ids: HashSet<(String, String)> = triage
            .redeploy_modules
            .iter()
            .map(|r| (r.id().to_string(), r.target_name().to_string()))
            .collect();
        for module in sharing {
            let key = (module.id.clone(), module.target_name.clone());
            if redeploy_ids.contains(&key) {
                continue;
            }
            if triage.undeploy_modules.iter().any(|m| *m == module) {
                continue;
            }
            tracing::debug!(module = %module.id, target = %module.target_name, "Undeploying module sharing the context root");
            triage.undeploy_modules.push(module);
        }
    }

    /// Undeploy stale module identities; failures and timeouts are logged
    /// and never abort the session.
    async fn undeploy_stale(
        &self,
        modules: &[ModuleRef],
        sink: &dyn ProgressSink,
        deadline: Instant,
    ) {
        if modules.is_empty() {
            return;
        }
        let manager = match self.instance.deployment_manager().await {
            Ok(manager) => manager,
            Err(e) => {
                tracing::warn!(error = %e, "No deployment manager for undeploy cleanup");
                return;
            }
        };
        let handle = match manager.undeploy(modules).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "Undeploy request failed");
                return;
            }
        };
        let budget = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        match track_progress(
            handle,
            sink,
            budget,
            self.instance.tuning().progress_poll_interval(),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Undeploy of stale modules reported failure"),
            Err(e) => tracing::warn!(error = %e, "Undeploy of stale modules did not finish"),
        }
    }

    /// Distribute first-time content to the given targets, preferring the
    /// backend's file-based path for directory content.
    async fn distribute(
        &self,
        spec: &ModuleSpec,
        targets: &[TargetRef],
        sink: &dyn ProgressSink,
        deadline: Instant,
    ) -> Result<Vec<ModuleRef>> {
        let incremental = self.instance.incremental_deployment().await?;

        let mut file_targets: Vec<TargetRef> = Vec::new();
        let mut archive_targets: Vec<TargetRef> = Vec::new();
        for target in targets {
            let file_capable = match &incremental {
                Some(incremental) if spec.content_dir.is_some() => {
                    incremental.can_file_deploy(target, spec).await
                }
                _ => false,
            };
            if file_capable {
                file_targets.push(target.clone());
            } else {
                archive_targets.push(target.clone());
            }
        }

        let mut distributed: Vec<ModuleRef> = Vec::new();

        if let Some(incremental) = &incremental {
            // file placements on different targets are independent
            let placements = futures::future::join_all(
                file_targets
                    .iter()
                    .map(|target| self.distribute_files(incremental, spec, target, sink, deadline)),
            )
            .await;
            for placement in placements {
                distributed.extend(placement?);
            }
        }

        if !archive_targets.is_empty() {
            let archive = spec.archive_path.clone().ok_or_else(|| {
                Error::Server(format!(
                    "Module {} has no archive and the backend does not support directory deployment",
                    spec.name
                ))
            })?;
            let manager = self.instance.deployment_manager().await?;
            let handle = manager
                .distribute(&archive_targets, &DeploymentContent::Archive(archive))
                .await
                .map_err(|e| Error::Server(format!("Distribute failed: {}", e)))?;
            let modules = self
                .track_deploy_op(handle, sink, deadline, "Distributing")
                .await?;
            distributed.extend(modules);
        }

        Ok(distributed)
    }

    /// First-time file-based placement on one target
    async fn distribute_files(
        &self,
        incremental: &Arc<dyn IncrementalDeployment>,
        spec: &ModuleSpec,
        target: &TargetRef,
        sink: &dyn ProgressSink,
        deadline: Instant,
    ) -> Result<Vec<ModuleRef>> {
        let dest = incremental
            .directory_for_new_application(target, spec)
            .await
            .ok_or_else(|| {
                Error::Distribution(format!(
                    "Backend offered no deployment directory on target {}",
                    target.name
                ))
            })?;
        sink.progress(&format!(
            "Copying {} to {}",
            spec.name,
            dest.display()
        ));
        let entries = self.provider.entries()?;
        InitialServerFileDistributor::distribute(&entries, &dest)?;

        let handle = incremental
            .initial_deploy(target, spec, &dest)
            .await
            .map_err(|e| Error::Server(format!("Initial deploy failed: {}", e)))?;
        self.track_deploy_op(handle, sink, deadline, "Deploying")
            .await
    }

    /// Incrementally redeploy one previously deployed module.
    ///
    /// An empty diff short-circuits: the prior record is returned unchanged
    /// and the backend is not called, unless `force_redeploy` is set.
    async fn redeploy(
        &self,
        spec: &ModuleSpec,
        mut record: TargetModule,
        force_redeploy: bool,
        sink: &dyn ProgressSink,
        deadline: Instant,
    ) -> Result<TargetModule> {
        let module = record.delegate()?.clone();
        let incremental = self.instance.incremental_deployment().await?;

        let deploy_dir = match &incremental {
            Some(incremental) => incremental.directory_for_module(&module).await,
            None => None,
        };

        if let (Some(incremental), Some(deploy_dir)) = (&incremental, deploy_dir) {
            let entries = self.provider.entries()?;
            let changes = ServerFileDistributor::distribute(
                &entries,
                &deploy_dir,
                &self.provider.descriptors(),
                &DiffMode::Timestamps,
            )?;
            if !changes.has_changes() && !force_redeploy {
                tracing::debug!(module = %record.id(), "No changes since last deployment, skipping redeploy");
                return Ok(record);
            }
            let handle = incremental
                .incremental_deploy(&module, &changes)
                .await
                .map_err(|e| Error::Server(format!("Incremental deploy failed: {}", e)))?;
            self.track_deploy_op(handle, sink, deadline, "Redeploying")
                .await?;
        } else {
            // no file-based path, fall back to a full redeploy
            let content = match (&spec.archive_path, &spec.content_dir) {
                (Some(archive), _) => DeploymentContent::Archive(archive.clone()),
                (None, Some(dir)) => DeploymentContent::Directory(dir.clone()),
                (None, None) => {
                    return Err(Error::Server(format!(
                        "Module {} has neither archive nor content directory",
                        spec.name
                    )));
                }
            };
            let manager = self.instance.deployment_manager().await?;
            let handle = manager
                .redeploy(std::slice::from_ref(&module), &content)
                .await
                .map_err(|e| Error::Server(format!("Redeploy failed: {}", e)))?;
            self.track_deploy_op(handle, sink, deadline, "Redeploying")
                .await?;
        }

        record.touch();
        self.store.write(&record)?;
        Ok(record)
    }

    /// Deploy-on-save entry point: a reduced deployment that only diffs and
    /// applies, designed for rapid iterative saves.
    ///
    /// Never returns an error; failures degrade to
    /// [`DeploymentState::DeploymentFailed`] since this path runs silently
    /// on every file save.
    #[tracing::instrument(skip(self, artifacts), fields(instance = %self.instance.url()))]
    pub async fn notify_artifacts_updated(&self, artifacts: &HashSet<PathBuf>) -> DeploymentState {
        // the fast path requires an actually running server in a state
        // that tolerates hot deployment
        if !self.instance.is_really_running().await {
            return DeploymentState::ServerStateUnsupported;
        }
        match self.instance.state() {
            ServerState::Suspended
            | ServerState::ProfilerBlocking
            | ServerState::ProfilerStarting => {
                return DeploymentState::ServerStateUnsupported;
            }
            _ => {}
        }

        let incremental = match self.instance.incremental_deployment().await {
            Ok(Some(incremental)) if incremental.supports_deploy_on_save() => incremental,
            Ok(_) => return DeploymentState::ServerStateUnsupported,
            Err(e) => {
                tracing::info!(error = %e, "No deployment manager for deploy on save");
                return DeploymentState::ServerStateUnsupported;
            }
        };

        let spec = self.provider.spec();
        let identity = self.identity_dir(&spec);
        let manager = match self.instance.deployment_manager().await {
            Ok(manager) => manager,
            Err(_) => return DeploymentState::ServerStateUnsupported,
        };
        let available = manager
            .available_modules(&self.targets)
            .await
            .unwrap_or_default();

        let mut any_applied = false;
        for target in &self.targets {
            if !incremental.can_file_deploy(target, &spec).await {
                return DeploymentState::ServerStateUnsupported;
            }
            let records = self.store.read_all(self.instance.url(), &target.name);
            let Some(mut record) = records
                .into_iter()
                .find(|r| r.content_dir() == identity.as_path())
            else {
                return DeploymentState::ModuleNotDeployed;
            };
            let Some(module) = available
                .iter()
                .find(|m| m.id == record.id() && m.target_name == target.name)
            else {
                return DeploymentState::ModuleNotDeployed;
            };
            record.resolve(module.clone());

            let Some(deploy_dir) = incremental.directory_for_module(module).await else {
                return DeploymentState::ServerStateUnsupported;
            };

            let entries = match self.provider.entries() {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "Module entries unavailable for deploy on save");
                    return DeploymentState::DeploymentFailed;
                }
            };
            let changes = match ServerFileDistributor::distribute(
                &entries,
                &deploy_dir,
                &self.provider.descriptors(),
                &DiffMode::ArtifactList(artifacts.clone()),
            ) {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(error = %e, "Deploy-on-save diff failed");
                    return DeploymentState::DeploymentFailed;
                }
            };
            if !changes.has_changes() {
                continue;
            }

            let applied = async {
                let handle = incremental
                    .deploy_on_save(module, &changes)
                    .await
                    .map_err(|e| Error::Server(e.to_string()))?;
                let deadline = Instant::now() + self.instance.deployment_timeout();
                self.track_deploy_op(handle, &NullSink, deadline, "Deploy on save")
                    .await
            }
            .await;
            match applied {
                Ok(_) => {
                    any_applied = true;
                    record.touch();
                    if let Err(e) = self.store.write(&record) {
                        tracing::warn!(error = %e, "Failed to refresh module record");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Deploy on save failed");
                    return DeploymentState::DeploymentFailed;
                }
            }
        }

        if any_applied {
            tracing::debug!("Deploy on save applied");
        }
        DeploymentState::ModuleUpdated
    }

    /// Track one deploy operation against the session deadline, returning
    /// the modules the backend reported on completion.
    async fn track_deploy_op(
        &self,
        handle: ProgressHandle,
        sink: &dyn ProgressSink,
        deadline: Instant,
        what: &str,
    ) -> Result<Vec<ModuleRef>> {
        let budget = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| {
                Error::Server(format!(
                    "{} skipped, deployment timeout already exhausted",
                    what
                ))
            })?;
        match track_progress(
            handle.clone(),
            sink,
            budget,
            self.instance.tuning().progress_poll_interval(),
        )
        .await
        {
            Ok(true) => Ok(handle.status().modules),
            Ok(false) => Err(Error::Server(handle.status().message)),
            Err(Error::Timeout(_)) => Err(Error::Server(format!(
                "{} did not finish within the deployment timeout",
                what
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Sink that drops progress messages; the deploy-on-save path runs silently
struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _message: &str) {}
}
