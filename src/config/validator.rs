use crate::config::{DevServerConfig, MIN_CHECK_TIMEOUT_MS};
use crate::error::{Error, Result};

/// Validates the settings shared by managed and unmanaged dev servers
pub fn validate_endpoint(config: &DevServerConfig) -> Result<()> {
    if config.host.trim().is_empty() {
        return Err(Error::InvalidConfiguration(
            "dev-server.host must not be empty".to_string(),
        ));
    }

    if config.port == Some(0) {
        return Err(Error::InvalidConfiguration(
            "dev-server.port must not be 0; leave it unset to have one assigned".to_string(),
        ));
    }

    if let Some(path) = config.check_path() {
        if !path.starts_with('/') {
            return Err(Error::InvalidConfiguration(format!(
                "dev-server.check-path must start with '/': {}",
                path
            )));
        }
    }

    Ok(())
}

/// Validates a configuration for a dev server started by this library
pub fn validate_managed(config: &DevServerConfig) -> Result<()> {
    validate_endpoint(config)?;

    if config.check_timeout < MIN_CHECK_TIMEOUT_MS {
        return Err(Error::InvalidConfiguration(format!(
            "dev-server.check-timeout must be greater than {}ms (got {}ms)",
            MIN_CHECK_TIMEOUT_MS, config.check_timeout
        )));
    }

    if config.command.is_empty() {
        return Err(Error::InvalidConfiguration(
            "a managed dev server needs a start command".to_string(),
        ));
    }

    Ok(())
}

/// Validates a configuration for a dev server started by someone else
pub fn validate_unmanaged(config: &DevServerConfig) -> Result<()> {
    validate_endpoint(config)?;

    // Nothing assigns a port to a server we do not start.
    if config.port.is_none() {
        return Err(Error::InvalidConfiguration(
            "an unmanaged dev server needs dev-server.port".to_string(),
        ));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &DevServerConfig) -> Result<()> {
    if config.managed {
        validate_managed(config)
    } else {
        validate_unmanaged(config)
    }
}
