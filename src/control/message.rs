//! Control message vocabulary.

use std::fmt;
use std::path::PathBuf;

/// What the watcher tells the controller each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Heartbeat, sent first on every watcher tick.
    Ping,
    /// The watched file was written or removed; rebuild the server.
    Restart,
    /// Nothing happened this tick; the controller should probe itself.
    End,
    /// Raw path of a filesystem event, for diagnostics only.
    Path(PathBuf),
    /// The event source closed and the watcher has exited.
    Stopped(String),
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Ping => write!(f, "Ping"),
            ControlMessage::Restart => write!(f, "Restart"),
            ControlMessage::End => write!(f, "End"),
            ControlMessage::Path(path) => write!(f, "{}", path.display()),
            ControlMessage::Stopped(reason) => write!(f, "Stopped({})", reason),
        }
    }
}
