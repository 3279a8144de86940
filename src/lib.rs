//! Self-restarting HTTP server driven by a watched configuration file.

pub mod config;
pub mod control;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::Settings;
pub use http::ServerFactory;
pub use lifecycle::LifecycleController;
