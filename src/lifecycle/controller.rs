//! The lifecycle controller: owner of the live server.
//!
//! The controller is the only code that creates, replaces or stops a
//! [`ServerHandle`]. It holds the current handle by value, so "which server
//! is live" is never shared across tasks.
//!
//! ```text
//!            ┌──────── End: probe own address ───────┐
//!            ▼                                        │
//! start ─▶ Running ── Restart ─▶ Restarting ─────────┘
//!                                 drain (≤ grace) → ack → cooldown → build + bind
//! ```
//!
//! The shutdown future is honoured between messages and during the two
//! pauses (restart cooldown, post-probe settle).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use axum::http::StatusCode;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::config::schema::{LifecycleConfig, Settings};
use crate::control::{ControlMessage, ControlReceiver};
use crate::http::probe::{LivenessProbe, ProbeError};
use crate::http::server::{ServerExit, ServerFactory, ServerHandle};
use crate::net::listener::{DrainOutcome, ListenerError};
use crate::observability::metrics;

/// Extra time past the drain deadline for the runner's acknowledgement.
const ACK_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("could not start server: {0}")]
    Server(#[from] ListenerError),

    #[error("liveness probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("config watcher stopped: {0}")]
    WatcherStopped(String),

    #[error("control channel closed")]
    ControlChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: LifecycleState,
    pub generation: u64,
    /// Bound address while a server is listening.
    pub address: Option<SocketAddr>,
}

pub struct LifecycleController {
    factory: ServerFactory,
    timing: LifecycleConfig,
    control: ControlReceiver,
    probe: LivenessProbe,
    done_tx: mpsc::Sender<ServerExit>,
    done_rx: mpsc::Receiver<ServerExit>,
    status: watch::Sender<ControllerStatus>,
}

impl LifecycleController {
    pub fn new(settings: &Settings, control: ControlReceiver) -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);
        let (status, _) = watch::channel(ControllerStatus {
            state: LifecycleState::Starting,
            generation: 0,
            address: None,
        });

        Self {
            factory: ServerFactory::new(settings),
            timing: settings.lifecycle,
            control,
            probe: LivenessProbe::new(settings.lifecycle.probe_timeout()),
            done_tx,
            done_rx,
            status,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    /// Start the first server and process control messages until
    /// `shutdown` resolves or a fatal condition occurs.
    ///
    /// `shutdown` also cuts short the restart cooldown and the post-probe
    /// settle delay.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut current = self.start_server(1).await?;

        loop {
            let message = tokio::select! {
                _ = &mut shutdown => {
                    self.shut_down(current).await;
                    return Ok(());
                }
                message = next_message(&mut self.control, self.timing.tick()) => message,
            };

            match message {
                Some(ControlMessage::Ping) => tracing::debug!("Watcher heartbeat"),
                Some(ControlMessage::Path(path)) => {
                    tracing::info!(path = %path.display(), "File event reported");
                }
                Some(ControlMessage::End) => {
                    if self.check_liveness(&current, shutdown.as_mut()).await? == Pause::Interrupted {
                        self.shut_down(current).await;
                        return Ok(());
                    }
                }
                Some(ControlMessage::Restart) => {
                    match self.restart(current, shutdown.as_mut()).await? {
                        Some(handle) => current = handle,
                        None => return Ok(()),
                    }
                }
                Some(ControlMessage::Stopped(reason)) => {
                    tracing::error!(reason = %reason, "Config watcher stopped");
                    self.shut_down(current).await;
                    return Err(LifecycleError::WatcherStopped(reason));
                }
                None => return Err(LifecycleError::ControlChannelClosed),
            }
        }
    }

    async fn start_server(&mut self, generation: u64) -> Result<ServerHandle, LifecycleError> {
        let handle = self
            .factory
            .build()
            .start(generation, self.done_tx.clone())
            .await?;

        tracing::info!(
            generation,
            address = %handle.local_addr(),
            message = %handle.message(),
            "Serving config map"
        );
        self.factory.pin_address(handle.local_addr());
        metrics::record_generation(generation);
        self.publish(LifecycleState::Running, generation, Some(handle.local_addr()));
        Ok(handle)
    }

    /// Replace `current` with a server built from the file as it is now.
    ///
    /// Returns `None` if shutdown was requested while no server was live.
    async fn restart<F>(
        &mut self,
        current: ServerHandle,
        shutdown: Pin<&mut F>,
    ) -> Result<Option<ServerHandle>, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        let generation = current.generation();
        tracing::info!(generation, "Config change, restarting server");
        self.publish(LifecycleState::Restarting, generation, None);

        self.stop_server(current).await;

        // The write that triggered this may still be in progress.
        if pause(self.timing.restart_cooldown(), shutdown).await == Pause::Interrupted {
            tracing::info!(generation, "Shutdown requested during restart");
            self.publish(LifecycleState::Stopped, generation, None);
            return Ok(None);
        }

        tracing::info!(
            generation = generation + 1,
            address = %self.factory.bind_address(),
            "Attempting to restart"
        );
        let handle = self.start_server(generation + 1).await?;
        metrics::record_restart();
        Ok(Some(handle))
    }

    async fn shut_down(&mut self, current: ServerHandle) {
        let generation = current.generation();
        self.stop_server(current).await;
        self.publish(LifecycleState::Stopped, generation, None);
    }

    /// Drain `handle` and wait for its runner to acknowledge. Never fails:
    /// a botched drain is logged and the caller carries on.
    async fn stop_server(&mut self, handle: ServerHandle) {
        let generation = handle.generation();
        let grace = self.timing.shutdown_grace();

        if !handle.shutdown(grace) {
            tracing::warn!(generation, "Server runner already gone");
        }

        let deadline = time::Instant::now() + grace + ACK_MARGIN;
        loop {
            match time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(exit)) if exit.generation == generation => {
                    log_exit(exit);
                    return;
                }
                Ok(Some(stale)) => {
                    tracing::debug!(generation = stale.generation, "Ignoring stale shutdown acknowledgement");
                }
                Ok(None) | Err(_) => {
                    metrics::record_shutdown("unacknowledged");
                    tracing::error!(generation, "Server did not acknowledge shutdown");
                    return;
                }
            }
        }
    }

    async fn check_liveness<F>(
        &self,
        current: &ServerHandle,
        shutdown: Pin<&mut F>,
    ) -> Result<Pause, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(address = %current.local_addr(), "Polling server");

        match self.probe.probe(current.local_addr()).await {
            Ok(report) if report.status == StatusCode::OK => {
                metrics::record_probe("ok");
                tracing::info!(generation = current.generation(), body = %report.body, "Liveness probe succeeded");
                Ok(pause(self.timing.probe_settle(), shutdown).await)
            }
            Ok(report) => {
                metrics::record_probe("unexpected_status");
                tracing::warn!(status = %report.status, "Liveness probe returned non-OK status");
                Ok(Pause::Elapsed)
            }
            Err(e) => {
                metrics::record_probe("failed");
                tracing::error!(address = %current.local_addr(), error = %e, "Liveness probe failed");
                Err(e.into())
            }
        }
    }

    fn publish(&self, state: LifecycleState, generation: u64, address: Option<SocketAddr>) {
        self.status.send_replace(ControllerStatus {
            state,
            generation,
            address,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Elapsed,
    Interrupted,
}

/// Sleep for `duration` unless `shutdown` resolves first.
async fn pause<F>(duration: Duration, shutdown: Pin<&mut F>) -> Pause
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = time::sleep(duration) => Pause::Elapsed,
        _ = shutdown => Pause::Interrupted,
    }
}

/// One controller tick: pause, then take the next message.
async fn next_message(control: &mut ControlReceiver, tick: Duration) -> Option<ControlMessage> {
    time::sleep(tick).await;
    control.recv().await
}

fn log_exit(exit: ServerExit) {
    match exit.outcome {
        DrainOutcome::Drained { connections } => {
            metrics::record_shutdown("drained");
            tracing::info!(generation = exit.generation, connections, "Server drained");
        }
        DrainOutcome::DeadlineExceeded { aborted } => {
            metrics::record_shutdown("deadline_exceeded");
            tracing::error!(
                generation = exit.generation,
                aborted,
                "Could not gracefully shutdown the server"
            );
        }
    }
}
