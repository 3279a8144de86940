//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (controller.rs):
//!     Build server from config file → Bind → Running
//!
//! Reload (controller.rs):
//!     Restart message → Drain old server (deadline) → Ack → Cooldown → Rebuild
//!
//! Liveness (controller.rs):
//!     End message → GET own address → log body (failure is fatal)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Drain current server → Exit
//! ```
//!
//! # Design Decisions
//! - One owner for the live server; replacement is a move, not a lock
//! - Shutdown has a deadline: stragglers are aborted
//! - A failed drain never blocks the rebuild

pub mod controller;
pub mod signals;

pub use controller::{ControllerStatus, LifecycleController, LifecycleError, LifecycleState};
