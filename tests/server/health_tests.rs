use super::support::{free_port, listener, serve_http};
use devserver_runner::config::StartCommand;
use devserver_runner::error::{Error, Result};
use devserver_runner::server::{CancelToken, HealthCheck, HealthPoller, ProcessEnv, ProcessSupervisor};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

fn poller() -> HealthPoller {
    HealthPoller::with_intervals(Duration::from_millis(50), Duration::from_millis(500)).unwrap()
}

#[tokio::test]
async fn test_ready_once_port_opens() -> Result<()> {
    let port = free_port();
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        serve_http(listener, 200).await.unwrap();
    });

    let started = Instant::now();
    let check = HealthCheck::new("127.0.0.1", port, Some("/"));
    let address = poller()
        .wait_until_ready(&check, Duration::from_secs(5), None, &CancelToken::new())
        .await?;

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(address.port, port);
    assert_eq!(address.host, "127.0.0.1");

    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_tcp_only_check() -> Result<()> {
    let (_listener, port) = listener().await;

    let check = HealthCheck::new("127.0.0.1", port, None);
    let address = poller().probe(&check).await.map_err(Error::Other)?;
    assert_eq!(address.port, port);

    Ok(())
}

#[tokio::test]
async fn test_localhost_falls_back_to_ipv4() -> Result<()> {
    let (_listener, port) = listener().await;

    let check = HealthCheck::new("localhost", port, None);
    let address = poller().probe(&check).await.map_err(Error::Other)?;
    assert_eq!(address.port, port);
    assert!(address.host == "localhost" || address.host == "127.0.0.1");

    Ok(())
}

#[tokio::test]
async fn test_error_status_is_not_ready() {
    let (listener, port) = listener().await;
    let server = serve_http(listener, 503);

    let check = HealthCheck::new("127.0.0.1", port, Some("/health"));
    let err = poller().probe(&check).await.unwrap_err();
    assert!(err.contains("503"), "unexpected probe error: {}", err);

    server.abort();
}

#[tokio::test]
async fn test_timeout_is_reported_after_deadline() {
    let port = free_port();
    let check = HealthCheck::new("127.0.0.1", port, Some("/"));

    let started = Instant::now();
    let result = poller()
        .wait_until_ready(&check, Duration::from_millis(1000), None, &CancelToken::new())
        .await;

    match result {
        Err(Error::HealthCheckTimeout { elapsed, last_error }) => {
            assert!(elapsed >= Duration::from_millis(1000));
            assert!(!last_error.is_empty());
        }
        other => panic!("expected HealthCheckTimeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_process_exit_is_noticed_before_timeout() -> Result<()> {
    let supervisor = ProcessSupervisor::new();
    let mut process = supervisor.start(&StartCommand::Shell("sleep 0.2; exit 1".to_string()), &ProcessEnv::default())?;

    let check = HealthCheck::new("127.0.0.1", free_port(), Some("/"));
    let started = Instant::now();
    let result = poller()
        .wait_until_ready(&check, Duration::from_secs(30), Some(&mut process), &CancelToken::new())
        .await;

    assert!(matches!(result, Err(Error::ProcessExited { .. })), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));

    supervisor.stop(&mut process).await
}

#[tokio::test]
async fn test_cancellation_interrupts_polling() {
    let check = HealthCheck::new("127.0.0.1", free_port(), Some("/"));
    let cancel = CancelToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = poller()
        .wait_until_ready(&check, Duration::from_secs(30), None, &cancel)
        .await;

    assert!(matches!(result, Err(Error::Interrupted(_))), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(2));
}
