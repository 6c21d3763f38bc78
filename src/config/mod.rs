//! Configuration module for devserver-runner.
//!
//! This module handles parsing, validation, and access to the dev server
//! configuration. It supports loading configurations from JSON or YAML
//! files or strings.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use devserver_runner::config::DevServerConfig;
//!
//! let config = DevServerConfig::from_file("devserver.yaml").unwrap();
//! println!("Dev server command: {}", config.command);
//! ```
//!
//! Creating and validating a configuration programmatically:
//!
//! ```
//! use devserver_runner::config::{DevServerConfig, StartCommand, validate_config};
//!
//! let config = DevServerConfig {
//!     port: Some(3000),
//!     command: StartCommand::Args(vec!["npm".to_string(), "start".to_string()]),
//!     ..Default::default()
//! };
//!
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{
    DEFAULT_CHECK_PATH, DEFAULT_CHECK_TIMEOUT_MS, DEFAULT_HOST, DevServerConfig,
    MIN_CHECK_TIMEOUT_MS, StartCommand,
};
pub use validator::validate_config;
