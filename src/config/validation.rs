//! Settings validation.
//!
//! Serde handles syntax; this checks the values make sense before the
//! controller starts. All problems are reported, not just the first.

use std::net::SocketAddr;

use crate::config::schema::Settings;

/// A single semantic problem with the settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("config_path must not be empty")]
    EmptyConfigPath,

    #[error("{field} is not a socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Check `settings`, returning every violation found.
pub fn validate_settings(settings: &Settings) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if settings.config_path.as_os_str().is_empty() {
        errors.push(ValidationError::EmptyConfigPath);
    }

    if settings.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: settings.listener.bind_address.clone(),
        });
    }

    let observability = &settings.observability;
    if observability.metrics_enabled && observability.metrics_socket_addr().is_none() {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: observability.metrics_address.clone(),
        });
    }

    let durations = [
        ("timeouts.read_secs", settings.timeouts.read_secs),
        ("timeouts.write_secs", settings.timeouts.write_secs),
        ("timeouts.idle_secs", settings.timeouts.idle_secs),
        ("lifecycle.tick_ms", settings.lifecycle.tick_ms),
        ("lifecycle.shutdown_grace_ms", settings.lifecycle.shutdown_grace_ms),
        ("lifecycle.probe_timeout_ms", settings.lifecycle.probe_timeout_ms),
    ];
    for (field, value) in durations {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration { field });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
