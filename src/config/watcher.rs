//! Configuration file watcher for hot reload.
//!
//! The watcher never reloads anything itself. It turns filesystem events for
//! one path into [`ControlMessage`]s and leaves the restart to the
//! lifecycle controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::control::{ChannelClosed, ControlMessage, ControlSender};
use crate::observability::metrics;

/// Error type for watch registration.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {}: {source}", .path.display())]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Coarse classification of a filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    Other,
}

impl FileEventKind {
    /// Only content writes and removals warrant a rebuild.
    pub fn triggers_restart(self) -> bool {
        matches!(self, FileEventKind::Write | FileEventKind::Remove)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileEventKind::Create => "create",
            FileEventKind::Write => "write",
            FileEventKind::Remove => "remove",
            FileEventKind::Rename => "rename",
            FileEventKind::Chmod => "chmod",
            FileEventKind::Other => "other",
        }
    }
}

impl From<&EventKind> for FileEventKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(ModifyKind::Metadata(_)) => FileEventKind::Chmod,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Rename,
            EventKind::Modify(_) => FileEventKind::Write,
            EventKind::Remove(_) => FileEventKind::Remove,
            _ => FileEventKind::Other,
        }
    }
}

/// A filesystem event for the watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Outcome of a non-blocking poll of an [`EventSource`].
#[derive(Debug)]
pub enum SourcePoll {
    Event(FileEvent),
    /// The backend reported an error; the source is still usable.
    Error(String),
    Empty,
    /// The source is gone for good.
    Closed,
}

/// Something that yields filesystem events for a single path.
pub trait EventSource: Send {
    /// Take one pending event without blocking.
    fn poll_event(&mut self) -> SourcePoll;

    /// Register the watch on the path again.
    fn rearm(&mut self) -> Result<(), WatchError>;
}

/// [`EventSource`] backed by the platform's native notification API.
pub struct NotifySource {
    path: PathBuf,
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl NotifySource {
    /// Create the watcher and register `path`.
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let (tx, events) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(WatchError::Init)?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            watcher,
            events,
        })
    }
}

impl EventSource for NotifySource {
    fn poll_event(&mut self) -> SourcePoll {
        match self.events.try_recv() {
            Ok(Ok(event)) => {
                let path = event
                    .paths
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.path.clone());
                SourcePoll::Event(FileEvent {
                    path,
                    kind: FileEventKind::from(&event.kind),
                })
            }
            Ok(Err(e)) => SourcePoll::Error(e.to_string()),
            Err(TryRecvError::Empty) => SourcePoll::Empty,
            Err(TryRecvError::Disconnected) => SourcePoll::Closed,
        }
    }

    fn rearm(&mut self) -> Result<(), WatchError> {
        // A removed file has already lost its registration.
        let _ = self.watcher.unwatch(&self.path);
        self.watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: self.path.clone(),
                source,
            })
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Watches one configuration file and reports on a control channel.
pub struct ConfigWatcher<S = NotifySource> {
    path: PathBuf,
    source: S,
    armed: bool,
}

impl ConfigWatcher<NotifySource> {
    /// Watch `path` with the native backend.
    ///
    /// Fails if the path cannot be registered, e.g. because it does not exist.
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let source = NotifySource::new(path)?;
        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(Self::with_source(path, source))
    }
}

impl<S: EventSource> ConfigWatcher<S> {
    /// Watch `path` through an already registered source.
    pub fn with_source(path: &Path, source: S) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
            armed: true,
        }
    }

    /// Run until the event source closes or the controller goes away.
    pub async fn run(mut self, control: ControlSender) {
        loop {
            match self.tick(&control).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    tracing::error!(path = %self.path.display(), "Event source closed, watcher stopped");
                    return;
                }
                Err(ChannelClosed) => {
                    tracing::info!("Controller gone, watcher exiting");
                    return;
                }
            }
        }
    }

    async fn tick(&mut self, control: &ControlSender) -> Result<Flow, ChannelClosed> {
        control.send(ControlMessage::Ping).await?;

        // The file came back after a removal we could not re-watch; its new
        // contents were never seen.
        if !self.armed && self.rearm() {
            tracing::info!(path = %self.path.display(), "Watch restored, requesting restart");
            control.send(ControlMessage::Restart).await?;
        }

        match self.source.poll_event() {
            SourcePoll::Closed => {
                control
                    .send(ControlMessage::Stopped("event source closed".to_string()))
                    .await?;
                return Ok(Flow::Stop);
            }
            SourcePoll::Event(event) => {
                metrics::record_watch_event(event.kind.as_str());
                tracing::info!(
                    path = %event.path.display(),
                    kind = event.kind.as_str(),
                    "File event"
                );
                control.send(ControlMessage::Path(event.path)).await?;

                if event.kind.triggers_restart() {
                    tracing::info!(path = %self.path.display(), "Config file modified");
                    control.send(ControlMessage::Restart).await?;
                    self.rearm();
                }
            }
            SourcePoll::Error(e) => {
                metrics::record_watch_event("error");
                tracing::error!(error = %e, "Watch error");
                control.send(ControlMessage::End).await?;
            }
            SourcePoll::Empty => {
                control.send(ControlMessage::End).await?;
            }
        }

        Ok(Flow::Continue)
    }

    fn rearm(&mut self) -> bool {
        match self.source.rearm() {
            Ok(()) => {
                self.armed = true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not re-register watch, will retry");
                self.armed = false;
            }
        }
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{channel, ControlReceiver};
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const WATCHED: &str = "/etc/config/configmap.yaml";

    struct ScriptedSource {
        polls: VecDeque<SourcePoll>,
        rearms: Arc<AtomicUsize>,
        failing_rearms: usize,
    }

    impl ScriptedSource {
        fn new(polls: Vec<SourcePoll>) -> (Self, Arc<AtomicUsize>) {
            let rearms = Arc::new(AtomicUsize::new(0));
            let source = Self {
                polls: polls.into(),
                rearms: rearms.clone(),
                failing_rearms: 0,
            };
            (source, rearms)
        }
    }

    impl EventSource for ScriptedSource {
        fn poll_event(&mut self) -> SourcePoll {
            self.polls.pop_front().unwrap_or(SourcePoll::Empty)
        }

        fn rearm(&mut self) -> Result<(), WatchError> {
            self.rearms.fetch_add(1, Ordering::SeqCst);
            if self.failing_rearms > 0 {
                self.failing_rearms -= 1;
                return Err(WatchError::Register {
                    path: PathBuf::from(WATCHED),
                    source: notify::Error::path_not_found(),
                });
            }
            Ok(())
        }
    }

    fn event(kind: FileEventKind) -> SourcePoll {
        SourcePoll::Event(FileEvent {
            path: PathBuf::from(WATCHED),
            kind,
        })
    }

    fn spawn_watcher(source: ScriptedSource) -> ControlReceiver {
        let (tx, rx) = channel();
        let watcher = ConfigWatcher::with_source(Path::new(WATCHED), source);
        tokio::spawn(watcher.run(tx));
        rx
    }

    async fn take(rx: &mut ControlReceiver, n: usize) -> Vec<ControlMessage> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(rx.recv().await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn idle_ticks_ping_then_end() {
        let (source, rearms) = ScriptedSource::new(vec![]);
        let mut rx = spawn_watcher(source);

        assert_eq!(
            take(&mut rx, 4).await,
            vec![
                ControlMessage::Ping,
                ControlMessage::End,
                ControlMessage::Ping,
                ControlMessage::End,
            ]
        );
        assert_eq!(rearms.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_event_requests_one_restart_and_rearms() {
        let (source, rearms) = ScriptedSource::new(vec![event(FileEventKind::Write)]);
        let mut rx = spawn_watcher(source);

        assert_eq!(
            take(&mut rx, 5).await,
            vec![
                ControlMessage::Ping,
                ControlMessage::Path(PathBuf::from(WATCHED)),
                ControlMessage::Restart,
                ControlMessage::Ping,
                ControlMessage::End,
            ]
        );
        assert_eq!(rearms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_event_is_echoed_without_restart() {
        let (source, rearms) = ScriptedSource::new(vec![event(FileEventKind::Create)]);
        let mut rx = spawn_watcher(source);

        assert_eq!(
            take(&mut rx, 4).await,
            vec![
                ControlMessage::Ping,
                ControlMessage::Path(PathBuf::from(WATCHED)),
                ControlMessage::Ping,
                ControlMessage::End,
            ]
        );
        assert_eq!(rearms.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn back_to_back_writes_each_restart() {
        let (source, rearms) = ScriptedSource::new(vec![
            event(FileEventKind::Write),
            event(FileEventKind::Write),
        ]);
        let mut rx = spawn_watcher(source);

        let messages = take(&mut rx, 8).await;
        let restarts = messages
            .iter()
            .filter(|m| **m == ControlMessage::Restart)
            .count();
        assert_eq!(restarts, 2);
        assert_eq!(messages[6], ControlMessage::Ping);
        assert_eq!(messages[7], ControlMessage::End);
        assert_eq!(rearms.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_rearm_is_retried_and_restarts_again() {
        let (mut source, rearms) = ScriptedSource::new(vec![event(FileEventKind::Remove)]);
        source.failing_rearms = 1;
        let mut rx = spawn_watcher(source);

        assert_eq!(
            take(&mut rx, 6).await,
            vec![
                ControlMessage::Ping,
                ControlMessage::Path(PathBuf::from(WATCHED)),
                ControlMessage::Restart,
                ControlMessage::Ping,
                ControlMessage::Restart,
                ControlMessage::End,
            ]
        );
        assert_eq!(rearms.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_errors_do_not_stop_the_loop() {
        let (source, _) = ScriptedSource::new(vec![SourcePoll::Error("queue overflow".into())]);
        let mut rx = spawn_watcher(source);

        assert_eq!(
            take(&mut rx, 4).await,
            vec![
                ControlMessage::Ping,
                ControlMessage::End,
                ControlMessage::Ping,
                ControlMessage::End,
            ]
        );
    }

    #[tokio::test]
    async fn closed_source_reports_stopped_and_exits() {
        let (source, _) = ScriptedSource::new(vec![SourcePoll::Closed]);
        let mut rx = spawn_watcher(source);

        assert_eq!(rx.recv().await, Some(ControlMessage::Ping));
        assert!(matches!(rx.recv().await, Some(ControlMessage::Stopped(_))));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn classifies_notify_kinds() {
        let cases = [
            (EventKind::Create(CreateKind::File), FileEventKind::Create),
            (
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                FileEventKind::Write,
            ),
            (EventKind::Modify(ModifyKind::Any), FileEventKind::Write),
            (
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                FileEventKind::Chmod,
            ),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                FileEventKind::Rename,
            ),
            (EventKind::Remove(RemoveKind::File), FileEventKind::Remove),
            (EventKind::Any, FileEventKind::Other),
        ];
        for (kind, expected) in cases {
            assert_eq!(FileEventKind::from(&kind), expected, "{:?}", kind);
        }
        assert!(FileEventKind::Write.triggers_restart());
        assert!(FileEventKind::Remove.triggers_restart());
        assert!(!FileEventKind::Create.triggers_restart());
        assert!(!FileEventKind::Rename.triggers_restart());
    }

    #[test]
    fn missing_file_cannot_be_watched() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigWatcher::new(&dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(WatchError::Register { .. })));
    }

    #[tokio::test]
    async fn native_source_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configmap.yaml");
        std::fs::write(&path, "message: hello\n").unwrap();

        let mut source = NotifySource::new(&path).unwrap();
        std::fs::write(&path, "message: world\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut saw_write = false;
        while tokio::time::Instant::now() < deadline && !saw_write {
            match source.poll_event() {
                SourcePoll::Event(event) => saw_write = event.kind == FileEventKind::Write,
                SourcePoll::Closed => panic!("source closed"),
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(saw_write, "no write event observed");
        assert!(source.rearm().is_ok());
    }
}
