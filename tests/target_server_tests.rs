mod common;

use common::{DirModule, MockState, registry_with_mock, write_web_module};
use deploy_runner::deploy::{DeploymentState, TargetServer};
use deploy_runner::module::TargetModuleStore;
use deploy_runner::plugin::{LogProgressSink, ModuleRef, TargetRef};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const URL: &str = "deployer:mock:localhost";

struct Fixture {
    state: Arc<MockState>,
    session: TargetServer,
    // keeps instances' weak registry reference alive for the test
    _registry: Arc<deploy_runner::ServerRegistry>,
    _content: tempfile::TempDir,
    _deploy: tempfile::TempDir,
    _store: tempfile::TempDir,
}

fn fixture(context_root: &str) -> Fixture {
    let content = tempfile::tempdir().unwrap();
    let deploy = tempfile::tempdir().unwrap();
    let store_root = tempfile::tempdir().unwrap();
    write_web_module(content.path());

    let state = MockState::new();
    *state.deploy_dir.lock().unwrap() = Some(deploy.path().to_path_buf());

    let registry = registry_with_mock(URL, &state);
    let instance = registry.require_instance(URL).unwrap();

    let provider = Arc::new(DirModule {
        name: "app".to_string(),
        content_dir: content.path().to_path_buf(),
        context_root: Some(context_root.to_string()),
        archive_path: None,
    });
    let session = TargetServer::new(
        instance,
        provider,
        vec![TargetRef::named("server")],
        Arc::new(TargetModuleStore::new(store_root.path())),
    );

    Fixture {
        state,
        session,
        _registry: registry,
        _content: content,
        _deploy: deploy,
        _store: store_root,
    }
}

#[tokio::test]
async fn test_first_deploy_takes_the_file_deploy_path() {
    let fx = fixture("/app");

    let modules = fx.session.deploy(&LogProgressSink, false).await.unwrap();

    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].id(), "app");
    assert_eq!(modules[0].target_name(), "server");
    assert_eq!(fx.state.initial_deploys.load(Ordering::SeqCst), 1);
    // directory content plus a dir-capable backend must never fall back to
    // the archive distribute operation
    assert_eq!(fx.state.distributes.load(Ordering::SeqCst), 0);
    // newly distributed modules are started
    assert_eq!(fx.state.module_starts.load(Ordering::SeqCst), 1);
    // content landed in the backend-chosen directory
    assert!(fx._deploy.path().join("WEB-INF/web.xml").exists());
}

#[tokio::test]
async fn test_unchanged_redeploy_cycle_is_skipped() {
    let fx = fixture("/app");

    let first = fx.session.deploy(&LogProgressSink, false).await.unwrap();
    let second = fx.session.deploy(&LogProgressSink, false).await.unwrap();

    // no file changed, so no backend update happened
    assert_eq!(fx.state.incremental_deploys.load(Ordering::SeqCst), 0);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id(), first[0].id());
    // the prior record is returned unchanged
    assert_eq!(second[0].timestamp_millis(), first[0].timestamp_millis());
}

#[tokio::test]
async fn test_changed_class_triggers_incremental_redeploy() {
    let fx = fixture("/app");

    let first = fx.session.deploy(&LogProgressSink, false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(
        fx._content.path().join("WEB-INF/classes/App.class"),
        "cafebabe v2",
    )
    .unwrap();

    let second = fx.session.deploy(&LogProgressSink, false).await.unwrap();

    assert_eq!(fx.state.incremental_deploys.load(Ordering::SeqCst), 1);
    assert!(second[0].timestamp_millis() >= first[0].timestamp_millis());
}

#[tokio::test]
async fn test_force_redeploy_bypasses_the_empty_diff_skip() {
    let fx = fixture("/app");

    fx.session.deploy(&LogProgressSink, false).await.unwrap();
    fx.session.deploy(&LogProgressSink, true).await.unwrap();

    assert_eq!(fx.state.incremental_deploys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_changed_context_root_forces_redistribute() {
    let content = tempfile::tempdir().unwrap();
    let deploy = tempfile::tempdir().unwrap();
    let store_root = tempfile::tempdir().unwrap();
    write_web_module(content.path());

    let state = MockState::new();
    *state.deploy_dir.lock().unwrap() = Some(deploy.path().to_path_buf());
    let registry = registry_with_mock(URL, &state);
    let instance = registry.require_instance(URL).unwrap();
    let store = Arc::new(TargetModuleStore::new(store_root.path()));

    let provider_v1 = Arc::new(DirModule {
        name: "app".to_string(),
        content_dir: content.path().to_path_buf(),
        context_root: Some("/app".to_string()),
        archive_path: None,
    });
    let session_v1 = TargetServer::new(
        Arc::clone(&instance),
        provider_v1,
        vec![TargetRef::named("server")],
        Arc::clone(&store),
    );
    session_v1.deploy(&LogProgressSink, false).await.unwrap();

    // same content, different context root: in-place update would leave
    // stale state, so the module is undeployed and redistributed
    let provider_v2 = Arc::new(DirModule {
        name: "app".to_string(),
        content_dir: content.path().to_path_buf(),
        context_root: Some("/other".to_string()),
        archive_path: None,
    });
    let session_v2 = TargetServer::new(
        instance,
        provider_v2,
        vec![TargetRef::named("server")],
        store,
    );
    session_v2.deploy(&LogProgressSink, false).await.unwrap();

    assert_eq!(state.undeploys.load(Ordering::SeqCst), 1);
    assert_eq!(state.initial_deploys.load(Ordering::SeqCst), 2);
    assert_eq!(state.incremental_deploys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shared_context_root_is_undeployed_first() {
    let fx = fixture("/app");

    // another module already owns the context root on the backend
    let stranger = ModuleRef {
        id: "old-app".to_string(),
        target_name: "server".to_string(),
        web_url: Some("/app".to_string()),
    };
    fx.state.available.lock().unwrap().push(stranger.clone());
    fx.state
        .shared_modules
        .lock()
        .unwrap()
        .push(("/app".to_string(), stranger.clone()));

    fx.session.deploy(&LogProgressSink, false).await.unwrap();

    assert_eq!(fx.state.undeploys.load(Ordering::SeqCst), 1);
    assert!(!fx.state.available.lock().unwrap().contains(&stranger));
}

#[tokio::test]
async fn test_missing_backend_module_is_redistributed() {
    let fx = fixture("/app");

    fx.session.deploy(&LogProgressSink, false).await.unwrap();
    // the backend lost the module (redeployed externally, server reset...)
    fx.state.available.lock().unwrap().clear();

    fx.session.deploy(&LogProgressSink, false).await.unwrap();
    assert_eq!(fx.state.initial_deploys.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_deploy_on_save_requires_running_server() {
    let fx = fixture("/app");

    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("index.html"));

    // server never started
    let state = fx.session.notify_artifacts_updated(&artifacts).await;
    assert_eq!(state, DeploymentState::ServerStateUnsupported);
    assert_eq!(fx.state.deploy_on_saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deploy_on_save_requires_backend_support() {
    let fx = fixture("/app");
    fx.session.deploy(&LogProgressSink, false).await.unwrap();

    fx.state.deploy_on_save.store(false, Ordering::SeqCst);
    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("index.html"));

    let state = fx.session.notify_artifacts_updated(&artifacts).await;
    assert_eq!(state, DeploymentState::ServerStateUnsupported);
}

#[tokio::test]
async fn test_deploy_on_save_applies_the_artifact_delta() {
    let fx = fixture("/app");
    fx.session.deploy(&LogProgressSink, false).await.unwrap();

    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("WEB-INF/classes/App.class"));

    let state = fx.session.notify_artifacts_updated(&artifacts).await;
    assert_eq!(state, DeploymentState::ModuleUpdated);
    assert_eq!(fx.state.deploy_on_saves.load(Ordering::SeqCst), 1);
    let changed = fx.state.last_deploy_on_save_changes.lock().unwrap();
    assert_eq!(changed.as_slice(), &[PathBuf::from("WEB-INF/classes/App.class")]);
}

#[tokio::test]
async fn test_deploy_on_save_of_unknown_module() {
    let fx = fixture("/app");
    // start the server without ever deploying the module
    fx.session
        .instance()
        .start(&LogProgressSink)
        .await
        .unwrap();

    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("index.html"));

    let state = fx.session.notify_artifacts_updated(&artifacts).await;
    assert_eq!(state, DeploymentState::ModuleNotDeployed);
}
