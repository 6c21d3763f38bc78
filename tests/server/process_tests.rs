use super::support::{pid_is_alive, read_pid_file, wait_until_dead, write_script};
use devserver_runner::config::StartCommand;
use devserver_runner::error::{Error, Result};
use devserver_runner::logs::{FilterDecision, LogLine, LogSource, OutputFilter};
use devserver_runner::server::{ProcessEnv, ProcessSupervisor};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Default)]
struct Collect {
    lines: Mutex<Vec<LogLine>>,
}

impl OutputFilter for Collect {
    fn filter(&self, line: &LogLine) -> FilterDecision {
        self.lines.lock().unwrap().push(line.clone());
        FilterDecision::Consume
    }
}

#[tokio::test]
async fn test_stop_is_idempotent() -> Result<()> {
    let supervisor = ProcessSupervisor::new();
    let command = StartCommand::Args(vec!["sleep".to_string(), "30".to_string()]);
    let mut process = supervisor.start(&command, &ProcessEnv::default())?;
    let pid = process.pid();

    assert!(process.is_alive());
    assert!(pid_is_alive(pid));

    supervisor.stop(&mut process).await?;
    assert!(process.is_stopped());
    assert!(!pid_is_alive(pid));

    // A second stop has nothing left to do
    supervisor.stop(&mut process).await?;
    assert!(process.is_stopped());

    Ok(())
}

#[tokio::test]
async fn test_stop_after_exit() -> Result<()> {
    let supervisor = ProcessSupervisor::new();
    let mut process = supervisor.start(&StartCommand::Shell("exit 3".to_string()), &ProcessEnv::default())?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = process.try_exit_status()?.expect("process should have exited");
    assert_eq!(status.code(), Some(3));
    assert!(!process.is_alive());

    supervisor.stop(&mut process).await?;
    Ok(())
}

#[tokio::test]
async fn test_process_ignoring_sigterm_is_killed_after_grace_period() -> Result<()> {
    let dir = tempdir().map_err(|e| Error::Other(e.to_string()))?;
    let script = write_script(dir.path(), "stubborn.sh", "trap '' TERM\nwhile true; do sleep 0.1; done");

    let supervisor = ProcessSupervisor::with_grace_period(Duration::from_millis(500));
    let command = StartCommand::Args(vec![script.display().to_string()]);
    let mut process = supervisor.start(&command, &ProcessEnv::default())?;
    let pid = process.pid();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.stop(&mut process).await?;

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!pid_is_alive(pid));

    Ok(())
}

#[tokio::test]
async fn test_spawn_failure() {
    let supervisor = ProcessSupervisor::new();
    let command = StartCommand::Args(vec!["/nonexistent/dev-server".to_string()]);

    match supervisor.start(&command, &ProcessEnv::default()) {
        Err(Error::Spawn { command, .. }) => assert_eq!(command, "/nonexistent/dev-server"),
        other => panic!("expected Spawn error, got {:?}", other.map(|p| p.pid())),
    }
}

#[tokio::test]
async fn test_output_lines_reach_the_router() -> Result<()> {
    let supervisor = ProcessSupervisor::new();
    let command = StartCommand::Shell("sleep 0.3; echo \"listening on $PORT\"; echo oops >&2; sleep 30".to_string());
    let env = ProcessEnv::default().with_var("PORT", "5173");
    let mut process = supervisor.start(&command, &env)?;

    let collect = Arc::new(Collect::default());
    process.output().add_filter(collect.clone());

    let deadline = Instant::now() + Duration::from_secs(5);
    while collect.lines.lock().unwrap().len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let lines = collect.lines.lock().unwrap().clone();
    assert!(lines.iter().any(|l| l.source == LogSource::Stdout && l.text == "listening on 5173"));
    assert!(lines.iter().any(|l| l.source == LogSource::Stderr && l.text == "oops"));

    supervisor.stop(&mut process).await?;
    Ok(())
}

#[tokio::test]
async fn test_working_directory() -> Result<()> {
    let dir = tempdir().map_err(|e| Error::Other(e.to_string()))?;
    let supervisor = ProcessSupervisor::new();
    let env = ProcessEnv {
        directory: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let mut process = supervisor.start(&StartCommand::Shell("touch marker".to_string()), &env)?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(dir.path().join("marker").exists());

    supervisor.stop(&mut process).await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_kills_children_left_by_exited_leader() -> Result<()> {
    let dir = tempdir().map_err(|e| Error::Other(e.to_string()))?;
    let pid_file = dir.path().join("child.pid");
    let supervisor = ProcessSupervisor::new();

    let command = StartCommand::Shell(format!("sleep 30 & echo $! > {}; exit 0", pid_file.display()));
    let mut process = supervisor.start(&command, &ProcessEnv::default())?;

    let child = read_pid_file(&pid_file, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(process.try_exit_status()?.is_some());
    assert!(pid_is_alive(child));

    supervisor.stop(&mut process).await?;

    assert!(wait_until_dead(child, Duration::from_secs(1)).await);
    Ok(())
}
