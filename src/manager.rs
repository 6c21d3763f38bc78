//! Brings up, reuses and tears down the dev server for a host application.

use crate::config::validator::{validate_managed, validate_unmanaged};
use crate::config::DevServerConfig;
use crate::error::{Error, Result};
use crate::forward::{ForwardedDevServer, RouteRegistrar};
use crate::logs::{DEFAULT_DEBOUNCE_WINDOW, LogDebouncer, LogSink, StartupLogCapture, TracingSink};
use crate::server::{
    CancelToken, DevServerState, HealthCheck, HealthPoller, InstanceId, LifecycleEvent,
    LifecycleLog, LifecycleRecord, ProcessEnv, ProcessHandle, ProcessSupervisor, ResolvedAddress,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A dev server in use by the manager
#[derive(Debug)]
pub struct DevServerInstance {
    /// Instance id
    id: InstanceId,
    /// Configuration the instance was built from
    config: DevServerConfig,
    /// Address that answered the health check
    endpoint: ResolvedAddress,
    /// The process, when managed
    process: Option<ProcessHandle>,
    /// Log debouncer attached to the process output, when managed
    debouncer: Option<LogDebouncer>,
}

impl DevServerInstance {
    /// Instance id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Configuration the instance was built from
    pub fn config(&self) -> &DevServerConfig {
        &self.config
    }

    /// Address that answered the health check
    pub fn endpoint(&self) -> &ResolvedAddress {
        &self.endpoint
    }

    /// Whether this library started the process
    pub fn is_managed(&self) -> bool {
        self.process.is_some()
    }

    /// OS process id, when managed
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Dev service description for the host
    pub fn properties(&self) -> Vec<(String, String)> {
        self.config.properties(self.endpoint.port)
    }
}

enum Slot {
    Absent,
    Starting { id: InstanceId, cancel: CancelToken },
    Running(DevServerInstance),
    Stopping,
}

impl Slot {
    fn state(&self) -> DevServerState {
        match self {
            Slot::Absent => DevServerState::Absent,
            Slot::Starting { .. } => DevServerState::Starting,
            Slot::Running(instance) if instance.is_managed() => DevServerState::Running,
            Slot::Running(_) => DevServerState::Unmanaged,
            Slot::Stopping => DevServerState::Stopping,
        }
    }
}

/// Owns at most one dev server at a time.
///
/// [`DevServerManager::acquire`] returns the endpoint of a dev server matching
/// the given configuration, starting or restarting one when needed.
/// [`DevServerManager::release`] tears it down. Forwarding installed through
/// [`DevServerManager::forward`] is uninstalled before the dev server it
/// points at goes away. Dropping the manager kills a managed process that is
/// still running.
///
/// `acquire`, `release` and `forward` are instrumented with `tracing` spans.
///
/// # Example
///
/// ```no_run
/// use devserver_runner::{DevServerConfig, DevServerManager};
/// use devserver_runner::config::StartCommand;
///
/// #[tokio::main]
/// async fn main() -> devserver_runner::Result<()> {
///     let manager = DevServerManager::new("webui")?;
///     let config = DevServerConfig {
///         port: Some(5173),
///         command: StartCommand::Shell("npm run dev".to_string()),
///         logs: true,
///         ..Default::default()
///     };
///
///     let endpoint = manager.acquire(&config).await?;
///     println!("forwarding unhandled requests to {}", endpoint);
///
///     manager.release().await;
///     Ok(())
/// }
/// ```
pub struct DevServerManager {
    /// Name used in log events
    name: String,
    /// Starts and stops processes
    supervisor: ProcessSupervisor,
    /// Probes dev servers
    poller: HealthPoller,
    /// Receives coalesced dev server output
    sink: Arc<dyn LogSink>,
    /// Debounce window for dev server output
    debounce_window: Duration,
    /// Current dev server
    slot: Mutex<Slot>,
    /// Serializes acquire calls
    acquire_gate: tokio::sync::Mutex<()>,
    /// Serializes teardown against the reuse/teardown step of acquire
    teardown_gate: tokio::sync::Mutex<()>,
    /// Lifecycle history
    lifecycle: LifecycleLog,
    /// Registrar holding forwarding to the current dev server
    route: Mutex<Option<Arc<dyn RouteRegistrar>>>,
}

impl DevServerManager {
    /// Create a manager with default timings, logging dev server output through `tracing`
    #[tracing::instrument(skip_all)]
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().to_string();
        tracing::debug!("Creating new DevServerManager");
        Ok(Self {
            sink: Arc::new(TracingSink::new(name.clone())),
            name,
            supervisor: ProcessSupervisor::new(),
            poller: HealthPoller::new()?,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            slot: Mutex::new(Slot::Absent),
            acquire_gate: tokio::sync::Mutex::new(()),
            teardown_gate: tokio::sync::Mutex::new(()),
            lifecycle: LifecycleLog::new(),
            route: Mutex::new(None),
        })
    }

    /// Replace the sink receiving coalesced dev server output
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the process supervisor
    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the health poller
    pub fn with_poller(mut self, poller: HealthPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Replace the debounce window for dev server output
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Name used in log events
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| Error::Other("Failed to lock dev server state".to_string()))
    }

    fn set_slot(&self, slot: Slot) {
        match self.slot.lock() {
            Ok(mut current) => *current = slot,
            Err(poisoned) => *poisoned.into_inner() = slot,
        }
    }

    async fn uninstall_route(&self) {
        let registrar = match self.route.lock() {
            Ok(mut route) => route.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(registrar) = registrar {
            tracing::debug!("Removing forwarding to the dev server");
            if let Err(e) = registrar.uninstall().await {
                tracing::warn!(error = %e, "Failed to remove dev server forwarding");
            }
        }
    }

    fn record(&self, instance: InstanceId, event: LifecycleEvent, details: Option<String>) {
        if let Err(e) = self.lifecycle.record(instance, event, details) {
            tracing::warn!(error = %e, "Failed to record lifecycle event");
        }
    }

    /// Return the endpoint of a dev server running with `config`.
    ///
    /// Reuses the current dev server when its configuration equals `config`.
    /// Otherwise the current one is torn down first, then the new one is
    /// either probed once (unmanaged) or started and polled until ready
    /// (managed). A failed start never leaves a process behind.
    #[tracing::instrument(skip(self, config), fields(server = %self.name, managed = config.managed))]
    pub async fn acquire(&self, config: &DevServerConfig) -> Result<ResolvedAddress> {
        let _acquire = self.acquire_gate.lock().await;

        {
            let _teardown = self.teardown_gate.lock().await;
            self.check_liveness();

            let previous = {
                let mut slot = self.lock_slot()?;
                if let Slot::Running(instance) = &*slot {
                    if instance.config == *config {
                        tracing::debug!(endpoint = %instance.endpoint, "Dev server config did not change; no need to restart");
                        let endpoint = instance.endpoint.clone();
                        self.record(instance.id, LifecycleEvent::Reused, None);
                        return Ok(endpoint);
                    }
                }
                match std::mem::replace(&mut *slot, Slot::Stopping) {
                    Slot::Running(instance) => Some(instance),
                    other => {
                        *slot = other;
                        None
                    }
                }
            };

            // Whatever forwarding exists points at a server that is going away
            self.uninstall_route().await;

            if let Some(instance) = previous {
                tracing::info!(endpoint = %instance.endpoint, "Dev server config changed; restarting");
                self.teardown(instance).await;
                self.set_slot(Slot::Absent);
            }
        }

        if config.managed {
            self.start_managed(config).await
        } else {
            self.adopt_unmanaged(config).await
        }
    }

    async fn adopt_unmanaged(&self, config: &DevServerConfig) -> Result<ResolvedAddress> {
        validate_unmanaged(config)?;
        let port = config
            .port
            .ok_or_else(|| Error::InvalidConfiguration("dev-server.port is required".to_string()))?;

        let check = HealthCheck::new(&config.host, port, config.check_path());
        let endpoint = self.poller.probe(&check).await.map_err(|last_error| {
            tracing::error!(host = %config.host, port, error = %last_error, "Unmanaged dev server is not answering");
            Error::UnmanagedServerNotFound {
                host: config.host.clone(),
                port,
            }
        })?;

        let instance = DevServerInstance {
            id: InstanceId::new(),
            config: config.clone(),
            endpoint: endpoint.clone(),
            process: None,
            debouncer: None,
        };
        self.record(instance.id, LifecycleEvent::Adopted, Some(endpoint.to_string()));
        tracing::info!(%endpoint, "Using dev server not managed by this process");
        self.set_slot(Slot::Running(instance));

        Ok(endpoint)
    }

    async fn start_managed(&self, config: &DevServerConfig) -> Result<ResolvedAddress> {
        validate_managed(config)?;

        let id = InstanceId::new();
        let cancel = CancelToken::new();
        self.set_slot(Slot::Starting {
            id,
            cancel: cancel.clone(),
        });
        self.record(id, LifecycleEvent::Starting, Some(config.command.to_string()));

        let started = Instant::now();
        let outcome = match self.launch(id, config, &cancel).await {
            Ok(instance) => {
                // Checked under the slot lock: release cancels under the same lock.
                let stored = {
                    let mut slot = self.lock_slot()?;
                    if cancel.is_cancelled() {
                        *slot = Slot::Stopping;
                        Err(instance)
                    } else {
                        let endpoint = instance.endpoint.clone();
                        *slot = Slot::Running(instance);
                        Ok(endpoint)
                    }
                };
                match stored {
                    Ok(endpoint) => Ok(endpoint),
                    Err(instance) => {
                        self.teardown(instance).await;
                        self.set_slot(Slot::Absent);
                        Err(Error::Interrupted("dev server released while starting".to_string()))
                    }
                }
            }
            Err(e) => {
                self.set_slot(Slot::Absent);
                Err(e)
            }
        };

        match &outcome {
            Ok(endpoint) => {
                self.record(id, LifecycleEvent::Started, Some(endpoint.to_string()));
                tracing::info!(
                    port = endpoint.port,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dev server is up and running on port {} (in {}ms)",
                    endpoint.port,
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                self.record(id, LifecycleEvent::Failed, Some(e.to_string()));
                tracing::error!(error = %e, "Dev server failed to start");
            }
        }

        outcome
    }

    async fn launch(
        &self,
        id: InstanceId,
        config: &DevServerConfig,
        cancel: &CancelToken,
    ) -> Result<DevServerInstance> {
        let port = match config.port {
            Some(port) => port,
            None => allocate_port().await?,
        };

        let env = ProcessEnv {
            directory: config.directory.clone(),
            vars: config.env.clone(),
        }
        .with_var("HOST", config.host.clone())
        .with_var("PORT", port.to_string());

        tracing::info!(command = %config.command, port, "Dev server starting");
        let mut process = self.supervisor.start(&config.command, &env)?;

        let capture = StartupLogCapture::attach(process.output());
        let debouncer = LogDebouncer::attach(
            process.output(),
            config.logs,
            self.debounce_window,
            Arc::clone(&self.sink),
        );

        let check = HealthCheck::new(&config.host, port, config.check_path());
        let ready = self
            .poller
            .wait_until_ready(&check, config.check_timeout_duration(), Some(&mut process), cancel)
            .await;

        match ready {
            Ok(endpoint) => {
                capture.close();
                Ok(DevServerInstance {
                    id,
                    config: config.clone(),
                    endpoint,
                    process: Some(process),
                    debouncer: Some(debouncer),
                })
            }
            Err(e) => {
                debouncer.close();
                capture.close_and_dump();
                if let Err(stop_error) = self.supervisor.stop(&mut process).await {
                    tracing::warn!(pid = process.pid(), error = %stop_error, "Failed to stop dev server after failed start");
                }
                Err(e)
            }
        }
    }

    async fn teardown(&self, mut instance: DevServerInstance) {
        if let Some(debouncer) = instance.debouncer.take() {
            debouncer.close();
        }
        if let Some(mut process) = instance.process.take() {
            if let Err(e) = self.supervisor.stop(&mut process).await {
                tracing::warn!(pid = process.pid(), error = %e, "Failed to stop dev server process");
            }
        }
        self.record(instance.id, LifecycleEvent::Stopped, None);
        tracing::info!(endpoint = %instance.endpoint, "Dev server stopped");
    }

    /// Tear down the current dev server.
    ///
    /// Installed forwarding is removed first. A start in progress is interrupted; the starting `acquire` stops the
    /// process and returns [`Error::Interrupted`]. Calling this with no dev
    /// server is a no-op. Teardown problems are logged, never returned.
    #[tracing::instrument(skip(self), fields(server = %self.name))]
    pub async fn release(&self) {
        let _teardown = self.teardown_gate.lock().await;

        let instance = {
            let mut slot = match self.slot.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match std::mem::replace(&mut *slot, Slot::Stopping) {
                Slot::Running(instance) => Some(instance),
                Slot::Starting { id, cancel } => {
                    tracing::info!(instance = %id, "Interrupting dev server start");
                    cancel.cancel();
                    *slot = Slot::Starting { id, cancel };
                    None
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };

        self.uninstall_route().await;

        match instance {
            Some(instance) => {
                self.teardown(instance).await;
                self.set_slot(Slot::Absent);
            }
            None => tracing::debug!("No running dev server to release"),
        }
    }

    /// Observe whether a managed dev server died since it became ready.
    ///
    /// A dead instance is dropped and the manager returns to
    /// [`DevServerState::Absent`]. Returns the resulting state.
    pub fn check_liveness(&self) -> DevServerState {
        let Ok(mut slot) = self.slot.lock() else {
            return DevServerState::Absent;
        };

        let exited = match &mut *slot {
            Slot::Running(instance) => match instance.process.as_mut() {
                Some(process) => match process.try_exit_status() {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to check dev server liveness");
                        None
                    }
                },
                None => None,
            },
            _ => None,
        };

        if let Some(status) = exited {
            if let Slot::Running(mut instance) = std::mem::replace(&mut *slot, Slot::Absent) {
                if let Some(debouncer) = instance.debouncer.take() {
                    debouncer.close();
                }
                tracing::warn!(endpoint = %instance.endpoint, %status, "Dev server process exited");
                self.record(instance.id, LifecycleEvent::Failed, Some(format!("process exited ({})", status)));
            }
        }

        slot.state()
    }

    /// Current state
    pub fn state(&self) -> DevServerState {
        self.slot
            .lock()
            .map(|slot| slot.state())
            .unwrap_or(DevServerState::Absent)
    }

    /// Endpoint of the current dev server
    pub fn endpoint(&self) -> Option<ResolvedAddress> {
        match &*self.slot.lock().ok()? {
            Slot::Running(instance) => Some(instance.endpoint.clone()),
            _ => None,
        }
    }

    /// Process id of the current dev server, when managed
    pub fn pid(&self) -> Option<u32> {
        match &*self.slot.lock().ok()? {
            Slot::Running(instance) => instance.pid(),
            _ => None,
        }
    }

    /// Dev service description of the current dev server
    pub fn properties(&self) -> Option<Vec<(String, String)>> {
        match &*self.slot.lock().ok()? {
            Slot::Running(instance) => Some(instance.properties()),
            _ => None,
        }
    }

    /// Forwarding target of the current dev server
    pub fn forwarded(&self) -> Option<ForwardedDevServer> {
        match &*self.slot.lock().ok()? {
            Slot::Running(instance) => Some(ForwardedDevServer::new(
                instance.endpoint.clone(),
                instance.config.websocket,
            )),
            _ => None,
        }
    }

    /// Lifecycle history, oldest first
    pub fn history(&self) -> Result<Vec<LifecycleRecord>> {
        self.lifecycle.events(None)
    }

    /// Acquire a dev server for `config` and install forwarding to it.
    ///
    /// The manager keeps `registrar` and uninstalls it on [`release`] or when
    /// a later `acquire` replaces the dev server.
    ///
    /// [`release`]: DevServerManager::release
    #[tracing::instrument(skip(self, config, registrar), fields(server = %self.name))]
    pub async fn forward(
        &self,
        config: &DevServerConfig,
        registrar: Arc<dyn RouteRegistrar>,
    ) -> Result<ForwardedDevServer> {
        let endpoint = self.acquire(config).await?;
        let target = ForwardedDevServer::new(endpoint, config.websocket);

        tracing::info!(port = target.endpoint.port, "Forwarding unhandled requests to port: {}", target.endpoint.port);
        registrar.install(&target).await?;

        match self.route.lock() {
            Ok(mut route) => *route = Some(registrar),
            Err(poisoned) => *poisoned.into_inner() = Some(registrar),
        }

        Ok(target)
    }
}

async fn allocate_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::Other(format!("Failed to allocate a dev server port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Other(format!("Failed to allocate a dev server port: {}", e)))?
        .port();
    tracing::debug!(port, "Assigned dev server port");
    Ok(port)
}
