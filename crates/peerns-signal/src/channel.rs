use serde_json::Value;
use tokio::sync::mpsc;

use crate::SignalError;

/// Buffer per channel direction. Generous so protocol bursts (registry
/// broadcasts, queue drains) never drop frames; sends await when full.
const CHANNEL_BUFFER: usize = 256;

/// What arrives on a channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An ordered, reliable JSON frame.
    Frame(Value),
    /// The remote side closed; no further frames will arrive.
    Closed,
}

/// One end of a reliable, ordered, bidirectional JSON-frame channel.
pub struct Channel {
    tx: ChannelHandle,
    rx: ChannelEvents,
    remote: Option<String>,
}

impl Channel {
    /// Create a connected pair of channel ends. Adapters hand one end to the
    /// claimant and return the other to the dialer.
    pub fn pair() -> (Channel, Channel) {
        Self::pair_labeled(None, None)
    }

    /// Like [`Channel::pair`], with each end told who its remote is: the
    /// dialer sees the endpoint it dialed, the claimant sees the dialer's
    /// primary endpoint (when the dialer announced one).
    pub fn pair_labeled(a_remote: Option<String>, b_remote: Option<String>) -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_BUFFER);
        (
            Channel {
                tx: ChannelHandle { peer: b_tx },
                rx: ChannelEvents { rx: a_rx },
                remote: a_remote,
            },
            Channel {
                tx: ChannelHandle { peer: a_tx },
                rx: ChannelEvents { rx: b_rx },
                remote: b_remote,
            },
        )
    }

    /// The remote's endpoint string, when the service knows it.
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub async fn send(&self, frame: &Value) -> Result<(), SignalError> {
        self.tx.send(frame).await
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.tx.close();
    }

    /// Split into a cloneable sender and the event stream, so a reader task
    /// can own the stream while the owner keeps sending.
    pub fn split(self) -> (ChannelHandle, ChannelEvents) {
        (self.tx, self.rx)
    }
}

/// Sending half of a channel. Dropping it closes the channel.
pub struct ChannelHandle {
    peer: mpsc::Sender<ChannelEvent>,
}

impl ChannelHandle {
    pub async fn send(&self, frame: &Value) -> Result<(), SignalError> {
        self.peer
            .send(ChannelEvent::Frame(frame.clone()))
            .await
            .map_err(|_| SignalError::ChannelClosed)
    }

    /// Signal close to the remote. Idempotent; best-effort if the peer is
    /// already gone.
    pub fn close(&self) {
        let _ = self.peer.try_send(ChannelEvent::Closed);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        // The remote learns the channel is gone even without an explicit
        // close().
        let _ = self.peer.try_send(ChannelEvent::Closed);
    }
}

/// Receiving half of a channel.
pub struct ChannelEvents {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelEvents {
    /// Next event. `None` after Closed has been observed and the sender side
    /// is fully dropped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}
