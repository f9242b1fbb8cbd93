mod common;

use common::{DirModule, MockPlugin, MockState, write_web_module};
use deploy_runner::error::Error;
use deploy_runner::instance::ServerState;
use deploy_runner::{DeployRunner, DeploymentState};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn runner_config(cache_dir: &std::path::Path) -> String {
    format!(
        r#"{{
            "serverInstances": {{
                "deployer:mock:localhost": {{
                    "plugin": "mock",
                    "displayName": "Mock Server"
                }}
            }},
            "moduleCacheDir": {},
            "tuning": {{ "deployOnSaveDelayMs": 100 }}
        }}"#,
        serde_json::to_string(cache_dir).unwrap()
    )
}

#[tokio::test]
async fn test_runner_lifecycle_round_trip() {
    let cache = tempfile::tempdir().unwrap();
    let state = MockState::new();

    let runner = DeployRunner::from_config_str(&runner_config(cache.path())).unwrap();
    runner.register_plugin(MockPlugin::named("mock", &state));
    let registered = runner.register_instances().unwrap();
    assert_eq!(registered, vec!["deployer:mock:localhost".to_string()]);

    runner.start_instance("deployer:mock:localhost").await.unwrap();
    assert_eq!(
        runner.instance_state("deployer:mock:localhost").unwrap(),
        ServerState::Running
    );

    let states = runner.all_instance_states();
    assert_eq!(
        states.get("deployer:mock:localhost"),
        Some(&ServerState::Running)
    );

    runner.stop_instance("deployer:mock:localhost").await.unwrap();
    assert_eq!(
        runner.instance_state("deployer:mock:localhost").unwrap(),
        ServerState::Stopped
    );
}

#[tokio::test]
async fn test_unknown_instance_is_reported() {
    let cache = tempfile::tempdir().unwrap();
    let runner = DeployRunner::from_config_str(&runner_config(cache.path())).unwrap();

    let result = runner.start_instance("deployer:unknown").await;
    assert!(matches!(result, Err(Error::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_unregistered_plugin_is_reported() {
    let cache = tempfile::tempdir().unwrap();
    let runner = DeployRunner::from_config_str(&runner_config(cache.path())).unwrap();

    // no plugin registered yet
    let result = runner.register_instances();
    assert!(matches!(result, Err(Error::PluginNotFound(_))));
}

#[tokio::test]
async fn test_runner_deploy_and_watch() {
    let cache = tempfile::tempdir().unwrap();
    let content = tempfile::tempdir().unwrap();
    let deploy_dir = tempfile::tempdir().unwrap();
    write_web_module(content.path());

    let state = MockState::new();
    *state.deploy_dir.lock().unwrap() = Some(deploy_dir.path().to_path_buf());

    let runner = DeployRunner::from_config_str(&runner_config(cache.path())).unwrap();
    runner.register_plugin(MockPlugin::named("mock", &state));
    runner.register_instances().unwrap();

    let provider = Arc::new(DirModule {
        name: "app".to_string(),
        content_dir: content.path().to_path_buf(),
        context_root: Some("/app".to_string()),
        archive_path: None,
    });

    let modules = runner
        .deploy(
            "deployer:mock:localhost",
            Arc::clone(&provider) as Arc<dyn deploy_runner::ModuleProvider>,
            Vec::new(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(state.initial_deploys.load(Ordering::SeqCst), 1);

    // deploy on save through the facade
    runner
        .watch_module(
            "web-app",
            "deployer:mock:localhost",
            provider,
            Vec::new(),
        )
        .await
        .unwrap();

    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("index.html"));
    runner
        .deploy_on_save()
        .submit_changed_artifacts("web-app", artifacts);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.deploy_on_saves.load(Ordering::SeqCst), 1);
    assert_eq!(
        runner.deploy_on_save().state_of("web-app"),
        Some(DeploymentState::ModuleUpdated)
    );
}

#[tokio::test]
async fn test_start_and_stop_all_instances() {
    let cache = tempfile::tempdir().unwrap();
    let state = MockState::new();

    let runner = DeployRunner::from_config_str(&runner_config(cache.path())).unwrap();
    runner.register_plugin(MockPlugin::named("mock", &state));
    runner.register_instances().unwrap();

    let started = runner.start_all_instances().await.unwrap();
    assert_eq!(started.len(), 1);
    runner.stop_all_instances().await.unwrap();
    assert_eq!(state.stops.load(Ordering::SeqCst), 1);
}
