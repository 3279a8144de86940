//! Rendezvous channel for control messages.
//!
//! Tokio has no zero-capacity mpsc, so each message travels with a oneshot
//! acknowledgement that the receiver fires as it takes the message. A send
//! therefore completes only once the controller has received it.

use tokio::sync::{mpsc, oneshot};

use crate::control::message::ControlMessage;

/// The receiving side went away; the message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

struct Envelope {
    message: ControlMessage,
    ack: oneshot::Sender<()>,
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Sending half, held by the watcher.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Envelope>,
}

impl ControlSender {
    /// Send `message` and wait until the receiver has taken it.
    pub async fn send(&self, message: ControlMessage) -> Result<(), ChannelClosed> {
        let (ack, delivered) = oneshot::channel();
        self.tx
            .send(Envelope { message, ack })
            .await
            .map_err(|_| ChannelClosed)?;

        // The receiver dropping a queued envelope also lands here.
        delivered.await.map_err(|_| ChannelClosed)
    }
}

/// Receiving half, held by the lifecycle controller.
pub struct ControlReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl ControlReceiver {
    /// Take the next message, releasing the blocked sender.
    ///
    /// Returns `None` once every sender has been dropped. Cancel safe.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        let Envelope { message, ack } = self.rx.recv().await?;
        let _ = ack.send(());
        Some(message)
    }
}
