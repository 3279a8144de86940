//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! settings file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → Settings (immutable for the life of the process)
//!
//! watched file (YAML)
//!     → watcher.rs detects write/remove
//!     → control channel → lifecycle controller
//!     → loader.rs loads a fresh MessageConfig for the rebuilt server
//! ```
//!
//! # Design Decisions
//! - MessageConfig is immutable once loaded; changes mean a new server
//! - A broken watched file degrades to an empty message, never an error
//! - All settings have defaults to allow minimal settings files

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_message_config, load_settings, ConfigError};
pub use schema::{LifecycleConfig, ListenerConfig, MessageConfig, Settings, TimeoutConfig};
pub use watcher::{ConfigWatcher, WatchError};
