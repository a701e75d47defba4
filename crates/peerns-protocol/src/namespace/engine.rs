//! Namespace engine driver — thin orchestrator around [`NamespaceState`].
//!
//! Owns the signaling handles, channels and timers for one namespace.
//! Multiplexes claim/dial outcomes, channel events, timer fires and
//! commands into the pure state machine and executes the effects it
//! returns. The only place in the namespace stack that touches I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use peerns_signal::{Channel, ChannelEvent, ChannelHandle, ClaimHandle, SignalError, Signaling};

use crate::contacts::ContactStore;
use crate::types::now_ms;
use crate::wire::Frame;

use super::effect::{ChannelId, ClaimKind, ClaimOutcome, DialKind, Effect, NsEvent, TimerKind};
use super::state::NamespaceState;

/// Commands the runtime sends to one engine.
#[derive(Debug)]
pub enum EngineCommand {
    SetName(String),
    Pause,
    Resume,
    Shutdown,
}

/// Events one engine surfaces to the runtime.
pub enum EngineEvent {
    Ns {
        namespace: String,
        event: NsEvent,
    },
    /// An inbound channel on our discovery id. The runtime answers
    /// rendezvous exchanges on these; the engine never parses them.
    InboundDiscovery {
        namespace: String,
        channel: Channel,
    },
    /// The engine task ended (shutdown or discovery-offline).
    Stopped {
        namespace: String,
    },
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    pub namespace: String,
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn set_name(&self, name: String) {
        let _ = self.cmd_tx.send(EngineCommand::SetName(name)).await;
    }

    pub async fn pause(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Resume).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown).await;
    }
}

/// Spawn the engine task for a prepared state machine.
pub fn spawn(
    signaling: Arc<dyn Signaling>,
    state: NamespaceState,
    store: Arc<Mutex<ContactStore>>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> EngineHandle {
    let namespace = state.config().base();
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (in_tx, in_rx) = mpsc::channel(256);

    let engine = Engine {
        namespace: namespace.clone(),
        signaling,
        state,
        store,
        event_tx,
        in_tx,
        channels: HashMap::new(),
        next_channel: 1,
        timers: HashMap::new(),
        router_claim: None,
        discovery_claim: None,
        slot_claim: None,
        stopped: false,
    };
    tokio::spawn(engine.run(cmd_rx, in_rx));

    EngineHandle { namespace, cmd_tx }
}

/// Tagged inputs feeding the single per-namespace stream.
enum Input {
    Dialed {
        kind: DialKind,
        result: Result<Channel, String>,
    },
    IncomingRouter(Channel),
    IncomingSlot(Channel),
    IncomingDiscovery(Channel),
    Channel {
        id: ChannelId,
        event: ChannelEvent,
    },
    ChannelGone {
        id: ChannelId,
    },
}

struct Engine {
    namespace: String,
    signaling: Arc<dyn Signaling>,
    state: NamespaceState,
    store: Arc<Mutex<ContactStore>>,
    event_tx: mpsc::Sender<EngineEvent>,
    in_tx: mpsc::Sender<Input>,
    channels: HashMap<ChannelId, ChannelHandle>,
    next_channel: u64,
    timers: HashMap<TimerKind, Instant>,
    router_claim: Option<ClaimHandle>,
    discovery_claim: Option<ClaimHandle>,
    slot_claim: Option<ClaimHandle>,
    stopped: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut in_rx: mpsc::Receiver<Input>,
    ) {
        debug!(namespace = %self.namespace, "namespace engine starting");
        let effects = self.state.start();
        self.execute(effects).await;

        while !self.stopped {
            // Copy the earliest deadline out so the sleep future does not
            // borrow `self` across the select arms.
            let next_deadline = self
                .timers
                .iter()
                .min_by_key(|(_, deadline)| **deadline)
                .map(|(kind, deadline)| (*kind, *deadline));

            let effects = tokio::select! {
                Some(input) = in_rx.recv() => self.handle_input(input).await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::SetName(name)) => self.state.set_name(&name, now_ms()),
                    Some(EngineCommand::Pause) => self.state.pause(),
                    Some(EngineCommand::Resume) => self.state.resume(),
                    Some(EngineCommand::Shutdown) | None => self.state.shutdown(),
                },
                kind = fire_at(next_deadline) => {
                    self.timers.remove(&kind);
                    self.state.handle_timer(kind, now_ms())
                }
            };
            self.execute(effects).await;
        }

        debug!(namespace = %self.namespace, "namespace engine stopped");
        let _ = self
            .event_tx
            .send(EngineEvent::Stopped {
                namespace: self.namespace.clone(),
            })
            .await;
    }

    async fn handle_input(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Dialed { kind, result } => match result {
                Ok(channel) => {
                    let id = self.register_channel(channel);
                    self.state.handle_dial(kind, Ok(id))
                }
                Err(reason) => self.state.handle_dial(kind, Err(reason)),
            },
            // Inbound channels carry their own protocol; the first frame
            // (checkin, reverse-welcome) drives the state machine.
            Input::IncomingRouter(channel) | Input::IncomingSlot(channel) => {
                self.register_channel(channel);
                Vec::new()
            }
            Input::IncomingDiscovery(channel) => {
                let _ = self
                    .event_tx
                    .send(EngineEvent::InboundDiscovery {
                        namespace: self.namespace.clone(),
                        channel,
                    })
                    .await;
                Vec::new()
            }
            Input::Channel { id, event } => match event {
                ChannelEvent::Frame(value) => match Frame::parse(&value) {
                    Ok(frame) => {
                        let mut store = self.store.lock().expect("contact store lock");
                        self.state.handle_frame(id, frame, &mut store, now_ms())
                    }
                    Err(e) => {
                        debug!(namespace = %self.namespace, %id, "ignoring frame: {e}");
                        Vec::new()
                    }
                },
                ChannelEvent::Closed => {
                    self.channels.remove(&id);
                    self.state.handle_channel_closed(id, now_ms())
                }
            },
            Input::ChannelGone { id } => {
                self.channels.remove(&id);
                self.state.handle_channel_closed(id, now_ms())
            }
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Claim(kind) => {
                    let more = self.do_claim(kind).await;
                    queue.extend(more);
                }
                Effect::Release(kind) => match kind {
                    ClaimKind::Router(_) => self.router_claim = None,
                    ClaimKind::Discovery => self.discovery_claim = None,
                    ClaimKind::PeerSlot => self.slot_claim = None,
                },
                Effect::Dial(kind) => self.do_dial(kind),
                Effect::Send { channel, frame } => {
                    let sent = match self.channels.get(&channel) {
                        Some(handle) => handle.send(&frame.to_value()).await.is_ok(),
                        None => false,
                    };
                    if !sent {
                        self.channels.remove(&channel);
                        queue.extend(self.state.handle_channel_closed(channel, now_ms()));
                    }
                }
                Effect::Close { channel } => {
                    if let Some(handle) = self.channels.remove(&channel) {
                        handle.close();
                    }
                }
                Effect::CloseAll => {
                    for (_, handle) in self.channels.drain() {
                        handle.close();
                    }
                }
                Effect::Arm { timer, after } => {
                    self.timers.insert(timer, Instant::now() + after);
                }
                Effect::Disarm(timer) => {
                    self.timers.remove(&timer);
                }
                Effect::DisarmAll => self.timers.clear(),
                Effect::Emit(event) => {
                    let _ = self
                        .event_tx
                        .send(EngineEvent::Ns {
                            namespace: self.namespace.clone(),
                            event,
                        })
                        .await;
                }
                Effect::Stop => self.stopped = true,
            }
        }
    }

    /// Claims run inline: they are one quick round-trip to the service and
    /// their outcome decides the very next transition.
    async fn do_claim(&mut self, kind: ClaimKind) -> Vec<Effect> {
        let endpoint = self.state.endpoint_for(kind);
        match self.signaling.claim(&endpoint).await {
            Ok(claimed) => {
                let (handle, mut incoming) = claimed.split();
                match kind {
                    ClaimKind::Router(_) => self.router_claim = Some(handle),
                    ClaimKind::Discovery => self.discovery_claim = Some(handle),
                    ClaimKind::PeerSlot => self.slot_claim = Some(handle),
                }
                let in_tx = self.in_tx.clone();
                tokio::spawn(async move {
                    while let Some(channel) = incoming.recv().await {
                        let input = match kind {
                            ClaimKind::Router(_) => Input::IncomingRouter(channel),
                            ClaimKind::PeerSlot => Input::IncomingSlot(channel),
                            ClaimKind::Discovery => Input::IncomingDiscovery(channel),
                        };
                        if in_tx.send(input).await.is_err() {
                            break;
                        }
                    }
                });
                self.state.handle_claim(kind, ClaimOutcome::Granted)
            }
            Err(SignalError::IdTaken(_)) => self.state.handle_claim(kind, ClaimOutcome::Taken),
            Err(e) => {
                warn!(namespace = %self.namespace, %endpoint, "claim failed: {e}");
                self.state
                    .handle_claim(kind, ClaimOutcome::Error(e.to_string()))
            }
        }
    }

    /// Dials run detached: a dead-but-claimed endpoint can hang well past
    /// the join timeout, and the machine must keep moving meanwhile.
    fn do_dial(&mut self, kind: DialKind) {
        let endpoint = self.state.endpoint_for_dial(kind);
        let signaling = self.signaling.clone();
        let in_tx = self.in_tx.clone();
        // Bound the task itself so hung dials do not accumulate.
        let cap = Duration::from_secs(30);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(cap, signaling.connect(&endpoint)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("dial timed out".to_string()),
            };
            let _ = in_tx.send(Input::Dialed { kind, result }).await;
        });
    }

    fn register_channel(&mut self, channel: Channel) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        let (handle, mut events) = channel.split();
        self.channels.insert(id, handle);

        let in_tx = self.in_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(event @ ChannelEvent::Frame(_)) => {
                        if in_tx.send(Input::Channel { id, event }).await.is_err() {
                            return;
                        }
                    }
                    Some(ChannelEvent::Closed) | None => {
                        let _ = in_tx.send(Input::ChannelGone { id }).await;
                        return;
                    }
                }
            }
        });
        id
    }
}

/// Wait for the given timer deadline; pend forever when none is armed.
async fn fire_at(next: Option<(TimerKind, Instant)>) -> TimerKind {
    match next {
        Some((kind, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            kind
        }
        None => std::future::pending().await,
    }
}
