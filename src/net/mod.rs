//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, one task per connection)
//!     → connection.rs (id, open count, idle tracking)
//!     → axum Router (http layer)
//!
//! Connection States:
//!     Active → Closing (drain or idle) → Closed
//!                 └─ aborted if still open at the drain deadline
//! ```

pub mod connection;
pub mod listener;

pub use listener::{DrainOutcome, Listener, ListenerError};
