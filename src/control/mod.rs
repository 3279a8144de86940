//! Control plane between the watcher and the lifecycle controller.
//!
//! # Data Flow
//! ```text
//! watcher task
//!     → ControlSender::send (blocks until taken)
//!     → ControlReceiver::recv (controller loop, once per tick)
//!
//! Vocabulary per watcher tick:
//!     Ping, then one of:
//!         End                       (no event pending)
//!         Path(p) [, Restart]       (event; Restart on write/remove)
//!         Stopped(reason)           (event source closed)
//! ```
//!
//! # Design Decisions
//! - Rendezvous semantics: a slow controller stalls the watcher
//! - Ping is a heartbeat contract, so the receive never waits forever

pub mod channel;
pub mod message;

pub use channel::{channel, ChannelClosed, ControlReceiver, ControlSender};
pub use message::ControlMessage;
