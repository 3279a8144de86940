//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! ServerFactory::build
//!     → load_message_config (fresh read of the watched file)
//!     → HttpServer (router with the message captured, not bound)
//!     → HttpServer::start (bind, spawn serve loop)
//!     → ServerHandle (owned by the lifecycle controller)
//!
//! LivenessProbe:
//!     GET / on the handle's own address → status + body
//! ```

pub mod probe;
pub mod server;

pub use probe::{LivenessProbe, ProbeError, ProbeReport};
pub use server::{HttpServer, ServerExit, ServerFactory, ServerHandle};
