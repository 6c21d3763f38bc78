use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host used when the configuration does not name one.
pub const DEFAULT_HOST: &str = "localhost";
/// Path probed by the health check when the configuration does not name one.
pub const DEFAULT_CHECK_PATH: &str = "/";
/// Health check timeout used when the configuration does not name one, in milliseconds.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 30_000;
/// Smallest accepted health check timeout, in milliseconds.
pub const MIN_CHECK_TIMEOUT_MS: u64 = 1_000;

/// Command used to start a managed dev server.
///
/// A plain string is run through the platform shell (`sh -c` or `cmd /C`),
/// a list is executed directly with its first element as the program.
///
/// # Examples
///
/// ```
/// use devserver_runner::config::StartCommand;
///
/// let shell: StartCommand = serde_json::from_str(r#""npm run dev""#).unwrap();
/// let args: StartCommand = serde_json::from_str(r#"["npx", "vite"]"#).unwrap();
///
/// assert_eq!(shell, StartCommand::Shell("npm run dev".to_string()));
/// assert_eq!(args.to_string(), "npx vite");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartCommand {
    /// A command line handed to the shell
    Shell(String),
    /// A program followed by its arguments
    Args(Vec<String>),
}

impl StartCommand {
    /// Returns true when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        match self {
            StartCommand::Shell(line) => line.trim().is_empty(),
            StartCommand::Args(args) => args.first().is_none_or(|program| program.is_empty()),
        }
    }

    /// Splits the command into the program to execute and its arguments.
    pub fn program_and_args(&self) -> Result<(String, Vec<String>)> {
        if self.is_empty() {
            return Err(Error::InvalidConfiguration(
                "dev server start command is empty".to_string(),
            ));
        }

        match self {
            StartCommand::Shell(line) => {
                #[cfg(unix)]
                let (shell, flag) = ("sh", "-c");
                #[cfg(not(unix))]
                let (shell, flag) = ("cmd", "/C");

                Ok((shell.to_string(), vec![flag.to_string(), line.clone()]))
            }
            StartCommand::Args(args) => Ok((args[0].clone(), args[1..].to_vec())),
        }
    }
}

impl Default for StartCommand {
    fn default() -> Self {
        StartCommand::Args(Vec::new())
    }
}

impl fmt::Display for StartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartCommand::Shell(line) => write!(f, "{}", line),
            StartCommand::Args(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Configuration of a single dev server.
///
/// Two configurations are compared with `==` to decide whether a running dev
/// server can be reused or must be restarted, so every field takes part in the
/// comparison.
///
/// # JSON Schema
///
/// ```json
/// {
///   "host": "localhost",
///   "port": 5173,
///   "managed": true,
///   "checkPath": "/",
///   "checkTimeout": 30000,
///   "logs": false,
///   "websocket": true,
///   "command": "npm run dev",
///   "directory": "src/main/webui",
///   "env": { "BROWSER": "none" }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use devserver_runner::config::{DevServerConfig, StartCommand};
///
/// let config = DevServerConfig {
///     port: Some(5173),
///     command: StartCommand::Shell("npm run dev".to_string()),
///     ..Default::default()
/// };
///
/// assert!(config.managed);
/// assert_eq!(config.check_path(), Some("/"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevServerConfig {
    /// Host the dev server listens on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the dev server listens on. A free port is assigned when absent.
    #[serde(default)]
    pub port: Option<u16>,

    /// Whether the dev server process is started and stopped by this library.
    #[serde(default = "default_true")]
    pub managed: bool,

    /// Path requested by the health check. Empty or absent means a TCP connect is enough.
    #[serde(default = "default_check_path")]
    pub check_path: Option<String>,

    /// Health check timeout in milliseconds.
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,

    /// Whether the dev server output is forwarded to the log.
    #[serde(default)]
    pub logs: bool,

    /// Whether WebSocket upgrades are forwarded to the dev server.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Command starting the dev server.
    #[serde(default)]
    pub command: StartCommand,

    /// Working directory of the dev server process.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Extra environment variables for the dev server process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_true() -> bool {
    true
}

fn default_check_path() -> Option<String> {
    Some(DEFAULT_CHECK_PATH.to_string())
}

fn default_check_timeout() -> u64 {
    DEFAULT_CHECK_TIMEOUT_MS
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            managed: true,
            check_path: default_check_path(),
            check_timeout: DEFAULT_CHECK_TIMEOUT_MS,
            logs: false,
            websocket: true,
            command: StartCommand::default(),
            directory: None,
            env: BTreeMap::new(),
        }
    }
}

impl DevServerConfig {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The contents are not valid JSON/YAML
    /// * The document does not match the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_from_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// The health check path, or `None` when only a TCP connect is required.
    pub fn check_path(&self) -> Option<&str> {
        self.check_path.as_deref().filter(|path| !path.is_empty())
    }

    /// The health check timeout as a [`Duration`].
    pub fn check_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.check_timeout)
    }

    /// Describes a dev server started from this configuration on `port`.
    ///
    /// The entries are ordered and meant for the host's dev-services listing.
    pub fn properties(&self, port: u16) -> Vec<(String, String)> {
        vec![
            ("dev-server.host".to_string(), self.host.clone()),
            ("dev-server.port".to_string(), port.to_string()),
            (
                "dev-server.check-timeout".to_string(),
                self.check_timeout.to_string(),
            ),
            (
                "dev-server.check-path".to_string(),
                self.check_path().unwrap_or_default().to_string(),
            ),
            ("dev-server.managed".to_string(), self.managed.to_string()),
            ("dev-server.logs".to_string(), self.logs.to_string()),
            ("dev-server.websocket".to_string(), self.websocket.to_string()),
        ]
    }
}
