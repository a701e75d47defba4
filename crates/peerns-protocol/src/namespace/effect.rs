use std::time::Duration;

use crate::types::PersistentId;
use crate::wire::Frame;

use super::registry::PeerSummary;

/// Driver-scoped handle to one signaling channel. Opaque to the state
/// machine; the driver owns the actual channel objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Which endpoint a claim refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// The level-L router endpoint.
    Router(u8),
    /// Our own discovery id in this namespace.
    Discovery,
    /// The reverse-connect ("-p1") slot.
    PeerSlot,
}

/// Result of a claim attempt. `Taken` is a signal, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted,
    Taken,
    Error(String),
}

/// Outbound connection attempts the driver performs for the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialKind {
    /// Join the router at `level` (attempt counter for staleness checks).
    Join { level: u8, attempt: u32 },
    /// Short liveness probe of the L1 router endpoint.
    Monitor,
    /// Router-side probe of the reverse-connect slot.
    SlotProbe,
}

/// Cancellation tokens for the per-namespace timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ping,
    Monitor,
    SlotProbe,
    SlotWindow,
    SlotRetry,
    JoinTimeout,
    JoinRetry,
    FailoverJitter,
    MigrateJitter,
    MigrateLinger,
}

/// Events the namespace surfaces to the node runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum NsEvent {
    /// Role or level changed.
    RoleChanged { router: bool, level: u8 },
    /// The registry changed; full peer list attached.
    PeersUpdated(Vec<PeerSummary>),
    /// Level cascade exhausted; discovery in this namespace is offline.
    DiscoveryOffline,
    /// A known contact was seen with a public key it lacked; the runtime
    /// records it and derives the pair key.
    PublicKeyObserved {
        persistent_id: PersistentId,
        public_key: String,
    },
    /// A non-self registry entry carrying a public key — the rendezvous
    /// scheduler matches these against the contact it is recovering.
    RendezvousCandidate {
        discovery_id: String,
        public_key: String,
    },
    /// Non-fatal error worth surfacing.
    Error { description: String },
}

/// Intention produced by the pure state machine. The driver executes these
/// against signaling, channels and timers; nothing else does I/O.
#[derive(Debug)]
pub enum Effect {
    Claim(ClaimKind),
    Release(ClaimKind),
    Dial(DialKind),
    Send { channel: ChannelId, frame: Frame },
    Close { channel: ChannelId },
    /// Close every open channel of this namespace (teardown path).
    CloseAll,
    Arm { timer: TimerKind, after: Duration },
    Disarm(TimerKind),
    DisarmAll,
    Emit(NsEvent),
    /// End the engine task. Claims drop with the driver.
    Stop,
}
