use crate::error::{Error, Result};
use crate::server::cancel::CancelToken;
use crate::server::process::ProcessHandle;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

/// Pause between two health probes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound for a single connect or HTTP request
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The host and port a dev server actually answered on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAddress {
    /// Host as it was probed
    pub host: String,
    /// Port
    pub port: u16,
}

impl ResolvedAddress {
    /// Create an address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port` with IPv6 literals bracketed
    pub fn base_url(&self) -> String {
        format!("http://{}", self)
    }

    /// `base_url` followed by `path`
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Hosts tried, in order, when probing a dev server configured on `host`.
///
/// Dev servers disagree on whether `localhost` means IPv4 or IPv6 and some
/// bind the wildcard address, so loopback spellings are tried as fallbacks.
/// Any other host is tried as configured and nothing else.
pub fn candidate_hosts(host: &str) -> Vec<String> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let fallbacks: &[&str] = match host {
        "localhost" => &["localhost", "127.0.0.1", "::1"],
        "0.0.0.0" | "::" => &["localhost", "127.0.0.1", "::1"],
        "127.0.0.1" => &["127.0.0.1", "localhost"],
        "::1" => &["::1", "localhost"],
        other => return vec![other.to_string()],
    };

    let mut candidates: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    if host != "0.0.0.0" && host != "::" {
        candidates.push(host.to_string());
    }
    for fallback in fallbacks {
        if !candidates.iter().any(|c| c == fallback) {
            candidates.push((*fallback).to_string());
        }
    }
    candidates
}

/// Where and how to probe a dev server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Configured host
    pub host: String,
    /// Port
    pub port: u16,
    /// HTTP path to request; TCP connect only when `None`
    pub path: Option<String>,
}

impl HealthCheck {
    /// Create a check; an empty path means TCP only
    pub fn new(host: impl Into<String>, port: u16, path: Option<&str>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }
}

/// Polls a dev server until it answers
#[derive(Debug, Clone)]
pub struct HealthPoller {
    /// Pause between probes
    retry_interval: Duration,
    /// Bound for a single connect/request
    probe_timeout: Duration,
    /// Client for HTTP checks
    http: reqwest::Client,
}

impl HealthPoller {
    /// Create a poller with the default retry interval
    pub fn new() -> Result<Self> {
        Self::with_intervals(DEFAULT_RETRY_INTERVAL, DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a poller with custom timings
    pub fn with_intervals(retry_interval: Duration, probe_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(probe_timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Other(format!("Failed to build health check client: {}", e)))?;

        Ok(Self {
            retry_interval,
            probe_timeout,
            http,
        })
    }

    /// Pause between probes
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Probe once, trying every candidate host.
    ///
    /// Returns the address that answered, or the last probe error.
    pub async fn probe(&self, check: &HealthCheck) -> std::result::Result<ResolvedAddress, String> {
        let mut last_error = format!("no candidate host for {}", check.host);

        for host in candidate_hosts(&check.host) {
            let address = ResolvedAddress::new(host, check.port);
            match self.probe_address(&address, check.path.as_deref()).await {
                Ok(()) => {
                    tracing::trace!(%address, "Dev server answered");
                    return Ok(address);
                }
                Err(e) => {
                    tracing::trace!(%address, error = %e, "Dev server probe failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn probe_address(&self, address: &ResolvedAddress, path: Option<&str>) -> std::result::Result<(), String> {
        let connect = TcpStream::connect((address.host.as_str(), address.port));
        match time::timeout(self.probe_timeout, connect).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => return Err(format!("{}: {}", address, e)),
            Err(_) => return Err(format!("{}: connect timed out", address)),
        }

        let Some(path) = path else {
            return Ok(());
        };

        let url = address.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("GET {}: {}", url, e))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(format!("GET {} answered {}", url, status));
        }
        Ok(())
    }

    /// Poll until the dev server answers, the timeout elapses, the process
    /// exits or `cancel` fires.
    ///
    /// # Errors
    ///
    /// * [`Error::HealthCheckTimeout`] once `timeout` has elapsed
    /// * [`Error::ProcessExited`] as soon as `process` is seen dead
    /// * [`Error::Interrupted`] within one retry interval of cancellation
    pub async fn wait_until_ready(
        &self,
        check: &HealthCheck,
        timeout: Duration,
        mut process: Option<&mut ProcessHandle>,
        cancel: &CancelToken,
    ) -> Result<ResolvedAddress> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u32 = 0;

        loop {
            if let Some(process) = process.as_deref_mut() {
                if let Some(status) = process.try_exit_status()? {
                    return Err(Error::ProcessExited {
                        status: status.to_string(),
                        elapsed: started.elapsed(),
                    });
                }
            }

            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let last_error = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Interrupted(format!(
                        "health check of {}:{} cancelled",
                        check.host, check.port
                    )));
                }
                outcome = time::timeout(remaining.max(Duration::from_millis(1)), self.probe(check)) => {
                    match outcome {
                        Ok(Ok(address)) => {
                            tracing::debug!(%address, attempts, elapsed = ?started.elapsed(), "Dev server is ready");
                            return Ok(address);
                        }
                        Ok(Err(e)) => e,
                        Err(_) => format!("probe of {}:{} timed out", check.host, check.port),
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::HealthCheckTimeout {
                    elapsed: now - started,
                    last_error,
                });
            }

            let pause = self.retry_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Interrupted(format!(
                        "health check of {}:{} cancelled",
                        check.host, check.port
                    )));
                }
                _ = time::sleep(pause) => {}
            }
        }
    }
}
