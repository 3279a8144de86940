//! Configuration schema definitions.
//!
//! Two documents live here: `Settings`, the process's own TOML settings,
//! and `MessageConfig`, the watched file whose contents the server echoes.
//! All types derive Serde traits for deserialization from config files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The watched configuration document.
///
/// Only `message` is recognized; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MessageConfig {
    /// Body returned by the HTTP route.
    pub message: String,
}

/// Root settings for the reloader process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Path of the watched configuration file.
    pub config_path: PathBuf,

    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Per-connection timeouts.
    pub timeouts: TimeoutConfig,

    /// Controller pacing and shutdown deadlines.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/config/configmap.yaml"),
            listener: ListenerConfig::default(),
            timeouts: TimeoutConfig::default(),
            lifecycle: LifecycleConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration for served connections.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for reading a request's headers, in seconds.
    pub read_secs: u64,

    /// Deadline for producing a response, in seconds.
    pub write_secs: u64,

    /// Keep-alive connections idle this long are closed, in seconds.
    pub idle_secs: u64,
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 5,
            write_secs: 10,
            idle_secs: 15,
        }
    }
}

/// Pacing of the controller loop and the restart cycle.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Sleep before every control channel receive, in milliseconds.
    pub tick_ms: u64,

    /// Deadline for in-flight requests during graceful shutdown.
    pub shutdown_grace_ms: u64,

    /// Pause between the old server stopping and the new one being built.
    pub restart_cooldown_ms: u64,

    /// Pause after a successful liveness probe.
    pub probe_settle_ms: u64,

    /// Upper bound on a single liveness probe.
    pub probe_timeout_ms: u64,
}

impl LifecycleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn probe_settle(&self) -> Duration {
        Duration::from_millis(self.probe_settle_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            shutdown_grace_ms: 2000,
            restart_cooldown_ms: 5000,
            probe_settle_ms: 2000,
            probe_timeout_ms: 5000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), used when RUST_LOG is unset.
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl ObservabilityConfig {
    pub fn metrics_socket_addr(&self) -> Option<SocketAddr> {
        self.metrics_address.parse().ok()
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
