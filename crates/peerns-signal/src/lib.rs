//! peerns signaling layer.
//!
//! Abstracts a third-party rendezvous service behind a stable API: claim a
//! globally unique string endpoint, connect to a named endpoint, accept
//! inbound channels, observe connection status. A channel carries ordered,
//! reliable JSON frames; ordering is guaranteed only within one channel.
//!
//! The production service is external. [`MemoryHub`] implements the same
//! contract in-process and is the substrate for every integration test.

mod backoff;
mod channel;
mod error;
mod memory;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelEvent, ChannelHandle, ChannelEvents};
pub use error::SignalError;
pub use memory::{MemoryHub, SquatGuard};

use std::any::Any;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Connection status of the signaling session, as surfaced to upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    /// Session established; claims and connects are serviced.
    Open,
    /// Transport lost; the adapter is re-opening the same claimed endpoints.
    Reconnecting,
    /// Session closed for good.
    Closed,
    /// The service rejected our endpoint as already claimed elsewhere.
    IdTaken,
}

/// Capability set consumed from the rendezvous service.
///
/// `Err(SignalError::IdTaken)` from [`claim`](Signaling::claim) is a protocol
/// signal (join instead of elect), not a failure.
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Claim a globally unique endpoint string. While the returned
    /// [`Claimed`] is alive, connects to that string reach us.
    async fn claim(&self, endpoint: &str) -> Result<Claimed, SignalError>;

    /// Open a channel to a named endpoint.
    async fn connect(&self, endpoint: &str) -> Result<Channel, SignalError>;

    /// Announce the endpoint this session is primarily reachable at, so
    /// parties we dial can identify us from the connection itself.
    fn set_label(&self, _label: &str) {}

    /// Observe session status transitions.
    fn status(&self) -> watch::Receiver<SignalStatus>;
}

/// A successfully claimed endpoint: the name plus the stream of inbound
/// channels. Dropping it (or any part of it) releases the claim.
pub struct Claimed {
    endpoint: String,
    incoming: mpsc::Receiver<Channel>,
    guard: Box<dyn Any + Send + Sync>,
}

impl Claimed {
    /// Assemble a claim from its parts. Adapters stash their release hook in
    /// `guard`; the endpoint is freed when the guard drops.
    pub fn new(endpoint: String, incoming: mpsc::Receiver<Channel>, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            endpoint,
            incoming,
            guard,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait for the next inbound channel. `None` once the claim is released.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }

    /// Split into a keepalive handle and the inbound stream, so an acceptor
    /// task can own the stream while the claim's lifetime stays elsewhere.
    pub fn split(self) -> (ClaimHandle, mpsc::Receiver<Channel>) {
        (
            ClaimHandle {
                endpoint: self.endpoint,
                _guard: self.guard,
            },
            self.incoming,
        )
    }

    /// Release the claim explicitly.
    pub fn release(self) {}
}

/// Keeps a claimed endpoint alive; dropping it releases the name.
pub struct ClaimHandle {
    endpoint: String,
    _guard: Box<dyn Any + Send + Sync>,
}

impl ClaimHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
