use super::support::{free_port, listener, pid_is_alive, read_pid_file, wait_until_dead};
use async_trait::async_trait;
use devserver_runner::config::{DevServerConfig, StartCommand};
use devserver_runner::error::{Error, Result};
use devserver_runner::forward::{DevServerProxy, ForwardedDevServer};
use devserver_runner::server::{HealthPoller, LifecycleEvent, ProcessSupervisor};
use devserver_runner::{DevServerManager, DevServerState, RouteRegistrar};
use mockall::mock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

mock! {
    pub Registrar {}

    #[async_trait]
    impl RouteRegistrar for Registrar {
        async fn install(&self, target: &ForwardedDevServer) -> Result<()>;
        async fn uninstall(&self) -> Result<()>;
    }
}

fn manager() -> DevServerManager {
    DevServerManager::new("test")
        .unwrap()
        .with_poller(HealthPoller::with_intervals(Duration::from_millis(50), Duration::from_millis(500)).unwrap())
        .with_supervisor(ProcessSupervisor::with_grace_period(Duration::from_secs(2)))
}

// The test owns the listener; the managed process only has to stay alive.
fn managed_config(port: u16, command: &str) -> DevServerConfig {
    DevServerConfig {
        host: "127.0.0.1".to_string(),
        port: Some(port),
        check_path: None,
        check_timeout: 5000,
        command: StartCommand::Shell(command.to_string()),
        ..Default::default()
    }
}

fn events(manager: &DevServerManager) -> Vec<LifecycleEvent> {
    manager.history().unwrap().iter().map(|r| r.event).collect()
}

#[tokio::test]
async fn test_equal_config_is_reused() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();
    let config = managed_config(port, "sleep 30");

    let first = manager.acquire(&config).await?;
    let pid = manager.pid().expect("managed dev server has a pid");
    assert_eq!(manager.state(), DevServerState::Running);

    let second = manager.acquire(&config.clone()).await?;
    assert_eq!(first, second);
    assert_eq!(manager.pid(), Some(pid));
    assert_eq!(
        events(&manager),
        vec![LifecycleEvent::Starting, LifecycleEvent::Started, LifecycleEvent::Reused]
    );

    manager.release().await;
    assert!(!pid_is_alive(pid));
    Ok(())
}

#[tokio::test]
async fn test_changed_config_restarts() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();

    let first_config = managed_config(port, "sleep 30");
    manager.acquire(&first_config).await?;
    let first_pid = manager.pid().expect("first pid");

    let mut second_config = first_config.clone();
    second_config.env.insert("VITE_MODE".to_string(), "staging".to_string());
    manager.acquire(&second_config).await?;
    let second_pid = manager.pid().expect("second pid");

    assert_ne!(first_pid, second_pid);
    assert!(!pid_is_alive(first_pid));
    assert!(pid_is_alive(second_pid));

    let history = manager.history()?;
    let kinds: Vec<LifecycleEvent> = history.iter().map(|r| r.event).collect();
    assert_eq!(
        kinds,
        vec![
            LifecycleEvent::Starting,
            LifecycleEvent::Started,
            LifecycleEvent::Stopped,
            LifecycleEvent::Starting,
            LifecycleEvent::Started,
        ]
    );
    // The first instance is gone before the second one starts
    assert_eq!(history[2].instance, history[0].instance);
    assert_ne!(history[3].instance, history[0].instance);

    manager.release().await;
    Ok(())
}

#[tokio::test]
async fn test_short_timeout_is_rejected_before_spawn() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let manager = manager();

    let mut config = managed_config(free_port(), &format!("touch {}; sleep 30", marker.display()));
    config.check_timeout = 500;

    let result = manager.acquire(&config).await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))), "got {:?}", result);
    assert_eq!(manager.state(), DevServerState::Absent);
    assert!(events(&manager).is_empty());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_timeout_kills_the_process() {
    let dir = tempdir().unwrap();
    let pid_file = dir.path().join("dev.pid");
    let manager = manager();

    let mut config = managed_config(free_port(), &format!("echo $$ > {}; exec sleep 30", pid_file.display()));
    config.check_timeout = 1000;

    let started = Instant::now();
    let result = manager.acquire(&config).await;

    assert!(matches!(result, Err(Error::HealthCheckTimeout { .. })), "got {:?}", result);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(manager.state(), DevServerState::Absent);

    let pid = read_pid_file(&pid_file, Duration::from_secs(1)).await;
    assert!(!pid_is_alive(pid));
    assert_eq!(
        events(&manager),
        vec![LifecycleEvent::Starting, LifecycleEvent::Failed]
    );
}

#[tokio::test]
async fn test_crash_during_start() {
    let manager = manager();
    let config = managed_config(free_port(), "echo 'Cannot find module vite' >&2; exit 1");

    let result = manager.acquire(&config).await;

    assert!(matches!(result, Err(Error::ProcessExited { .. })), "got {:?}", result);
    assert_eq!(manager.state(), DevServerState::Absent);
    assert!(manager.endpoint().is_none());
}

#[tokio::test]
async fn test_assigned_port_is_passed_to_the_process() -> Result<()> {
    let dir = tempdir().map_err(|e| Error::Other(e.to_string()))?;
    let port_file = dir.path().join("port");
    let manager = manager();

    let mut config = managed_config(0, &format!("echo $PORT > {}; exec sleep 30", port_file.display()));
    config.port = None;
    config.check_timeout = 1000;

    // Nothing listens on the assigned port, so the start times out
    let result = manager.acquire(&config).await;
    assert!(matches!(result, Err(Error::HealthCheckTimeout { .. })), "got {:?}", result);

    let port = read_pid_file(&port_file, Duration::from_secs(1)).await;
    assert!(port > 0 && port <= u16::MAX as u32);
    Ok(())
}

#[tokio::test]
async fn test_release_is_idempotent() -> Result<()> {
    let manager = manager();
    manager.release().await;
    assert_eq!(manager.state(), DevServerState::Absent);

    let (_listener, port) = listener().await;
    manager.acquire(&managed_config(port, "sleep 30")).await?;
    let pid = manager.pid().expect("pid");

    manager.release().await;
    manager.release().await;

    assert_eq!(manager.state(), DevServerState::Absent);
    assert!(!pid_is_alive(pid));
    assert_eq!(
        events(&manager),
        vec![LifecycleEvent::Starting, LifecycleEvent::Started, LifecycleEvent::Stopped]
    );
    Ok(())
}

#[tokio::test]
async fn test_release_interrupts_start() {
    let dir = tempdir().unwrap();
    let pid_file = dir.path().join("dev.pid");
    let manager = Arc::new(manager());

    let mut config = managed_config(free_port(), &format!("echo $$ > {}; exec sleep 30", pid_file.display()));
    config.check_timeout = 30_000;

    let acquiring = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire(&config).await })
    };

    let pid = read_pid_file(&pid_file, Duration::from_secs(5)).await;
    assert_eq!(manager.state(), DevServerState::Starting);

    let started = Instant::now();
    manager.release().await;
    let result = acquiring.await.unwrap();

    assert!(matches!(result, Err(Error::Interrupted(_))), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.state(), DevServerState::Absent);
    assert!(!pid_is_alive(pid));
}

#[tokio::test]
async fn test_crash_after_start_is_detected() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();
    let config = managed_config(port, "sleep 1");

    manager.acquire(&config).await?;
    assert_eq!(manager.state(), DevServerState::Running);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(manager.check_liveness(), DevServerState::Absent);
    assert_eq!(events(&manager).last(), Some(&LifecycleEvent::Failed));

    // The next acquire starts a fresh process
    let config = managed_config(port, "sleep 30");
    manager.acquire(&config).await?;
    assert_eq!(manager.state(), DevServerState::Running);

    manager.release().await;
    Ok(())
}

#[tokio::test]
async fn test_unmanaged_server_is_adopted() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();
    let config = DevServerConfig {
        host: "127.0.0.1".to_string(),
        port: Some(port),
        managed: false,
        check_path: None,
        ..Default::default()
    };

    let endpoint = manager.acquire(&config).await?;

    assert_eq!(endpoint.port, port);
    assert_eq!(manager.state(), DevServerState::Unmanaged);
    assert_eq!(manager.pid(), None);
    assert_eq!(events(&manager), vec![LifecycleEvent::Adopted]);

    let properties = manager.properties().expect("properties");
    assert!(properties.contains(&("dev-server.managed".to_string(), "false".to_string())));

    manager.release().await;
    assert_eq!(manager.state(), DevServerState::Absent);
    Ok(())
}

#[tokio::test]
async fn test_unmanaged_server_not_found() {
    let manager = manager();
    let port = free_port();
    let config = DevServerConfig {
        host: "127.0.0.1".to_string(),
        port: Some(port),
        managed: false,
        ..Default::default()
    };

    match manager.acquire(&config).await {
        Err(Error::UnmanagedServerNotFound { host, port: p }) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(p, port);
        }
        other => panic!("expected UnmanagedServerNotFound, got {:?}", other),
    }
    assert_eq!(manager.state(), DevServerState::Absent);
}

#[tokio::test]
async fn test_forward_installs_route() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();
    let config = DevServerConfig {
        host: "127.0.0.1".to_string(),
        port: Some(port),
        managed: false,
        check_path: None,
        websocket: false,
        ..Default::default()
    };

    let mut registrar = MockRegistrar::new();
    registrar
        .expect_install()
        .withf(move |target| target.port() == port && !target.websocket)
        .times(1)
        .returning(|_| Ok(()));
    registrar.expect_uninstall().times(0);

    let target = manager.forward(&config, Arc::new(registrar)).await?;

    assert_eq!(target.endpoint.port, port);
    assert_eq!(manager.forwarded(), Some(target));
    Ok(())
}

#[tokio::test]
async fn test_forward_does_not_install_on_failure() {
    let manager = manager();
    let config = DevServerConfig {
        host: "127.0.0.1".to_string(),
        port: Some(free_port()),
        managed: false,
        ..Default::default()
    };

    let mut registrar = MockRegistrar::new();
    registrar.expect_install().times(0);

    let result = manager.forward(&config, Arc::new(registrar)).await;
    assert!(matches!(result, Err(Error::UnmanagedServerNotFound { .. })));
}

#[tokio::test]
async fn test_start_returns_once_reachable() -> Result<()> {
    let port = free_port();
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        // Keep the port open until the test aborts us
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(listener);
    });

    let manager = manager();
    let started = Instant::now();
    let endpoint = manager.acquire(&managed_config(port, "sleep 30")).await?;

    assert_eq!(endpoint.port, port);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_millis(1500));

    manager.release().await;
    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_release_uninstalls_route() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();

    let mut registrar = MockRegistrar::new();
    registrar.expect_install().times(1).returning(|_| Ok(()));
    registrar.expect_uninstall().times(1).returning(|| Ok(()));

    manager.forward(&managed_config(port, "sleep 30"), Arc::new(registrar)).await?;
    manager.release().await;
    // Nothing left to uninstall
    manager.release().await;

    assert_eq!(manager.state(), DevServerState::Absent);
    assert_eq!(manager.forwarded(), None);
    Ok(())
}

#[tokio::test]
async fn test_restart_removes_stale_route() -> Result<()> {
    let (_listener, port) = listener().await;
    let manager = manager();
    let proxy = Arc::new(DevServerProxy::new()?);

    let first_config = managed_config(port, "sleep 30");
    let target = manager.forward(&first_config, proxy.clone()).await?;
    assert_eq!(proxy.target(), Some(target));

    let mut second_config = first_config.clone();
    second_config.env.insert("VITE_MODE".to_string(), "staging".to_string());
    manager.acquire(&second_config).await?;
    assert_eq!(proxy.target(), None);

    let target = manager.forward(&second_config, proxy.clone()).await?;
    assert_eq!(proxy.target(), Some(target));

    manager.release().await;
    assert_eq!(proxy.target(), None);
    Ok(())
}

// The outer shell forks, so the dev server is a grandchild of the spawned process
fn forking_command(pid_file: &std::path::Path) -> String {
    format!("sh -c 'echo $$ > {}; exec sleep 30'; true", pid_file.display())
}

#[tokio::test]
async fn test_release_stops_forked_children() -> Result<()> {
    let dir = tempdir().map_err(|e| Error::Other(e.to_string()))?;
    let pid_file = dir.path().join("grandchild.pid");
    let (_listener, port) = listener().await;
    let manager = manager();

    manager.acquire(&managed_config(port, &forking_command(&pid_file))).await?;
    let grandchild = read_pid_file(&pid_file, Duration::from_secs(2)).await;
    assert!(pid_is_alive(grandchild));

    manager.release().await;

    assert!(wait_until_dead(grandchild, Duration::from_secs(1)).await);
    Ok(())
}

#[tokio::test]
async fn test_timeout_stops_forked_children() {
    let dir = tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let manager = manager();

    let mut config = managed_config(free_port(), &forking_command(&pid_file));
    config.check_timeout = 1000;

    let result = manager.acquire(&config).await;
    assert!(matches!(result, Err(Error::HealthCheckTimeout { .. })), "got {:?}", result);

    let grandchild = read_pid_file(&pid_file, Duration::from_secs(1)).await;
    assert!(wait_until_dead(grandchild, Duration::from_secs(1)).await);
}
