//! Runner tests against the in-memory agent

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tunnelwatch_agent::testing::{AgentCall, RecordingAgent};
use tunnelwatch_agent::TunnelAgentClient;
use tunnelwatch_cli::{RunOptions, Settings, SettingsStore};

fn configured() -> Settings {
    let mut settings = Settings::default();
    settings.tunnel.token = "T".to_string();
    settings.tunnel.auth_name = "u".to_string();
    settings.tunnel.auth_pass = "p".to_string();
    settings
}

struct Running {
    _temp: TempDir,
    store: Arc<SettingsStore>,
    agent: Arc<RecordingAgent>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("runner did not stop")
            .unwrap()
    }
}

fn spawn_runner(settings: &Settings, once: bool) -> Running {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(SettingsStore::with_path(temp.path().join("settings.json")));
    store.save(settings).unwrap();

    let agent = Arc::new(RecordingAgent::new());
    let (stop, stopped) = oneshot::channel::<()>();
    let options = RunOptions {
        once,
        watch_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let client: Arc<dyn TunnelAgentClient> = agent.clone();
    let runner_store = store.clone();
    let task = tokio::spawn(async move {
        tunnelwatch_cli::run(&runner_store, client, options, async {
            let _ = stopped.await;
        })
        .await
    });

    Running {
        _temp: temp,
        store,
        agent,
        stop: Some(stop),
        task,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_startup_connect_and_shutdown() {
    let running = spawn_runner(&configured(), false);
    let agent = running.agent.clone();

    wait_for(|| agent.open_tunnels().len() == 1).await;
    assert!(agent.calls().iter().any(|call| matches!(
        call,
        AgentCall::OpenTunnel { port: 5000, .. }
    )));

    running.stop().await.unwrap();
    assert!(!agent.is_running());
    assert_eq!(agent.calls().last(), Some(&AgentCall::Stop));
}

#[tokio::test]
async fn test_auto_connect_disabled_waits() {
    let mut settings = configured();
    settings.tunnel.auto_connect = false;
    let running = spawn_runner(&settings, false);
    let agent = running.agent.clone();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(agent.calls().is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_token_edit_restarts_agent() {
    let running = spawn_runner(&configured(), false);
    let agent = running.agent.clone();
    wait_for(|| agent.open_tunnels().len() == 1).await;

    let mut edited = configured();
    edited.tunnel.token = "T2".to_string();
    running.store.save(&edited).unwrap();

    wait_for(|| {
        agent
            .calls()
            .iter()
            .any(|call| matches!(call, AgentCall::Start { auth_token, .. } if auth_token == "T2"))
    })
    .await;
    wait_for(|| agent.open_tunnels().len() == 1).await;

    let calls = agent.calls();
    let stop = calls.iter().position(|call| *call == AgentCall::Stop).unwrap();
    let restart = calls
        .iter()
        .position(|call| matches!(call, AgentCall::Start { auth_token, .. } if auth_token == "T2"))
        .unwrap();
    assert!(stop < restart);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_port_edit_reopens_tunnel() {
    let running = spawn_runner(&configured(), false);
    let agent = running.agent.clone();
    wait_for(|| agent.open_tunnels().len() == 1).await;

    let mut edited = configured();
    edited.public_port = Some(8443);
    running.store.save(&edited).unwrap();

    wait_for(|| {
        agent
            .calls()
            .iter()
            .any(|call| matches!(call, AgentCall::OpenTunnel { port: 8443, .. }))
    })
    .await;
    assert_eq!(agent.open_tunnels().len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_once_ignores_edits() {
    let running = spawn_runner(&configured(), true);
    let agent = running.agent.clone();
    wait_for(|| agent.open_tunnels().len() == 1).await;

    let mut edited = configured();
    edited.tunnel.subdomain = Some("printer".to_string());
    running.store.save(&edited).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let opens = agent
        .calls()
        .iter()
        .filter(|call| matches!(call, AgentCall::OpenTunnel { .. }))
        .count();
    assert_eq!(opens, 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_once_fails_without_token() {
    let running = spawn_runner(&Settings::default(), true);

    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("runner did not finish")
        .unwrap();
    assert!(result.is_err());
}
