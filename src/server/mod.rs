/// Dev server process management for devserver-runner.
///
/// This module spawns and stops dev server processes, probes them until
/// they answer, and records their lifecycle.
///
/// # Components
///
/// * `process` - Spawning and terminating the dev server process
/// * `health` - Polling the dev server until it accepts connections
/// * `lifecycle` - Manager states and the lifecycle event history
/// * `cancel` - Interrupting a start that is still waiting for readiness
///
/// # Examples
///
/// Starting a process and waiting for it to listen:
///
/// ```no_run
/// use devserver_runner::config::StartCommand;
/// use devserver_runner::server::{CancelToken, HealthCheck, HealthPoller, ProcessEnv, ProcessSupervisor};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> devserver_runner::Result<()> {
///     let supervisor = ProcessSupervisor::new();
///     let command = StartCommand::Shell("npm run dev -- --port 5173".to_string());
///     let mut process = supervisor.start(&command, &ProcessEnv::default())?;
///
///     let poller = HealthPoller::new()?;
///     let check = HealthCheck::new("localhost", 5173, Some("/"));
///     let address = poller
///         .wait_until_ready(&check, Duration::from_secs(30), Some(&mut process), &CancelToken::new())
///         .await?;
///     println!("dev server ready on {}", address);
///
///     supervisor.stop(&mut process).await
/// }
/// ```
pub mod cancel;
pub mod health;
pub mod lifecycle;
mod process;

pub use cancel::CancelToken;
pub use health::{HealthCheck, HealthPoller, ResolvedAddress, candidate_hosts};
pub use lifecycle::{DevServerState, InstanceId, LifecycleEvent, LifecycleLog, LifecycleRecord};
pub use process::{DEFAULT_GRACE_PERIOD, ProcessEnv, ProcessHandle, ProcessSupervisor};
