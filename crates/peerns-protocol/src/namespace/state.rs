//! The per-namespace state machine.
//!
//! Pure logic, zero async, zero network. Every handle_* / tick entry point
//! returns `Vec<Effect>`; the engine driver executes them. Contact lookups
//! happen through a borrowed [`ContactStore`], which owns all mutation.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::contacts::{ContactStore, KeyOutcome};
use crate::types::{
    DiscoveryUuid, JOIN_RETRY_MS, JOIN_TIMEOUT_MS, MAX_JOIN_ATTEMPTS, MAX_LEVEL,
    MIGRATE_LINGER_MS, MONITOR_IV_MS, PEER_TTL_GRACE_MS, PEER_TTL_MS, PING_IV_MS,
    SLOT_PROBE_IV_MS, SLOT_WINDOW_MS,
};
use crate::wire::Frame;

use super::config::NamespaceConfig;
use super::effect::{ChannelId, ClaimKind, ClaimOutcome, DialKind, Effect, NsEvent, TimerKind};
use super::registry::{Registry, RegistryEntry};

/// Timer intervals, overridable so tests can compress time.
#[derive(Debug, Clone)]
pub struct Timings {
    pub ping: Duration,
    pub peer_ttl: Duration,
    pub join_timeout: Duration,
    pub join_retry: Duration,
    pub slot_probe: Duration,
    pub slot_window: Duration,
    pub monitor: Duration,
    pub migrate_linger: Duration,
    pub failover_jitter_max: Duration,
    pub migrate_jitter_max: Duration,
    pub slot_retry_min: Duration,
    pub slot_retry_max: Duration,
    pub max_level: u8,
    pub max_join_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            ping: Duration::from_millis(PING_IV_MS),
            peer_ttl: Duration::from_millis(PEER_TTL_MS + PEER_TTL_GRACE_MS),
            join_timeout: Duration::from_millis(JOIN_TIMEOUT_MS),
            join_retry: Duration::from_millis(JOIN_RETRY_MS),
            slot_probe: Duration::from_millis(SLOT_PROBE_IV_MS),
            slot_window: Duration::from_millis(SLOT_WINDOW_MS),
            monitor: Duration::from_millis(MONITOR_IV_MS),
            migrate_linger: Duration::from_millis(MIGRATE_LINGER_MS),
            failover_jitter_max: Duration::from_millis(3_000),
            migrate_jitter_max: Duration::from_millis(2_000),
            slot_retry_min: Duration::from_millis(3_000),
            slot_retry_max: Duration::from_millis(5_000),
            max_level: MAX_LEVEL,
            max_join_attempts: MAX_JOIN_ATTEMPTS,
        }
    }
}

/// Where the machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Electing { level: u8 },
    Joining { level: u8, attempt: u32 },
    PeerSlot { level: u8 },
    Peer { level: u8 },
    Router { level: u8 },
}

impl Role {
    pub fn level(&self) -> u8 {
        match self {
            Role::Idle => 0,
            Role::Electing { level }
            | Role::Joining { level, .. }
            | Role::PeerSlot { level }
            | Role::Peer { level }
            | Role::Router { level } => *level,
        }
    }
}

pub struct NamespaceState {
    cfg: NamespaceConfig,
    timings: Timings,
    uuid: DiscoveryUuid,
    friendly_name: String,
    public_key: Option<String>,
    role: Role,
    registry: Registry,
    router_channel: Option<ChannelId>,
    discovery_claimed: bool,
    slot_active: bool,
    migrate_target: Option<u8>,
    paused: bool,
    rng: StdRng,
}

impl NamespaceState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: NamespaceConfig,
        timings: Timings,
        uuid: DiscoveryUuid,
        friendly_name: String,
        public_key: Option<String>,
        jitter_seed: Option<u64>,
        now: u64,
    ) -> Self {
        let self_id = cfg.discovery_id(&uuid);
        let registry = Registry::new(self_id, friendly_name.clone(), public_key.clone(), now);
        let rng = match jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            cfg,
            timings,
            uuid,
            friendly_name,
            public_key,
            role: Role::Idle,
            registry,
            router_channel: None,
            discovery_claimed: false,
            slot_active: false,
            migrate_target: None,
            paused: false,
            rng,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.cfg
    }

    pub fn self_discovery_id(&self) -> String {
        self.cfg.discovery_id(&self.uuid)
    }

    /// Endpoint string for a claim kind.
    pub fn endpoint_for(&self, kind: ClaimKind) -> String {
        match kind {
            ClaimKind::Router(level) => self.cfg.router_id(level),
            ClaimKind::Discovery => self.self_discovery_id(),
            ClaimKind::PeerSlot => self.cfg.peer_slot_id(),
        }
    }

    /// Endpoint string for a dial kind.
    pub fn endpoint_for_dial(&self, kind: DialKind) -> String {
        match kind {
            DialKind::Join { level, .. } => self.cfg.router_id(level),
            DialKind::Monitor => self.cfg.router_id(1),
            DialKind::SlotProbe => self.cfg.peer_slot_id(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    pub fn start(&mut self) -> Vec<Effect> {
        self.elect(1)
    }

    /// Tear down but keep the discovery claim so the rendezvous string is
    /// not lost to a competitor while suspended.
    pub fn pause(&mut self) -> Vec<Effect> {
        self.paused = true;
        self.teardown(true)
    }

    pub fn resume(&mut self) -> Vec<Effect> {
        if !self.paused {
            return Vec::new();
        }
        self.paused = false;
        self.elect(1)
    }

    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut effects = self.teardown(false);
        effects.push(Effect::Stop);
        effects
    }

    /// Name change: update the self entry and re-checkin / re-broadcast.
    pub fn set_name(&mut self, name: &str, _now: u64) -> Vec<Effect> {
        self.friendly_name = name.to_string();
        self.registry.set_self_name(name);
        match self.role {
            Role::Peer { .. } => match self.router_channel {
                Some(ch) => vec![Effect::Send {
                    channel: ch,
                    frame: self.checkin_frame(),
                }],
                None => Vec::new(),
            },
            Role::Router { .. } => {
                let mut effects = self.broadcast_registry();
                effects.push(Effect::Emit(NsEvent::PeersUpdated(self.registry.summaries())));
                effects
            }
            _ => Vec::new(),
        }
    }

    // ── Claims ─────────────────────────────────────────────────────────

    pub fn handle_claim(&mut self, kind: ClaimKind, outcome: ClaimOutcome) -> Vec<Effect> {
        match (kind, outcome) {
            (ClaimKind::Router(level), ClaimOutcome::Granted) => {
                if self.role != (Role::Electing { level }) {
                    // Stale grant from a superseded election
                    return vec![Effect::Release(ClaimKind::Router(level))];
                }
                self.become_router(level)
            }
            (ClaimKind::Router(level), ClaimOutcome::Taken) => {
                if self.role != (Role::Electing { level }) {
                    return Vec::new();
                }
                self.start_join(level, 0)
            }
            (ClaimKind::Router(_), ClaimOutcome::Error(description)) => {
                vec![Effect::Emit(NsEvent::Error { description })]
            }

            (ClaimKind::Discovery, ClaimOutcome::Granted) => {
                self.discovery_claimed = true;
                Vec::new()
            }
            (ClaimKind::Discovery, ClaimOutcome::Taken) => {
                vec![Effect::Emit(NsEvent::Error {
                    description: "discovery id already claimed in this namespace".into(),
                })]
            }
            (ClaimKind::Discovery, ClaimOutcome::Error(description)) => {
                vec![Effect::Emit(NsEvent::Error { description })]
            }

            (ClaimKind::PeerSlot, ClaimOutcome::Granted) => {
                if !matches!(self.role, Role::PeerSlot { .. }) {
                    return vec![Effect::Release(ClaimKind::PeerSlot)];
                }
                self.slot_active = true;
                vec![Effect::Arm {
                    timer: TimerKind::SlotWindow,
                    after: self.timings.slot_window,
                }]
            }
            (ClaimKind::PeerSlot, ClaimOutcome::Taken) => {
                if !matches!(self.role, Role::PeerSlot { .. }) {
                    return Vec::new();
                }
                // Another NAT-blocked peer holds the slot; retry shortly.
                let delay = self.rng.gen_range(
                    self.timings.slot_retry_min.as_millis() as u64
                        ..=self.timings.slot_retry_max.as_millis() as u64,
                );
                vec![Effect::Arm {
                    timer: TimerKind::SlotRetry,
                    after: Duration::from_millis(delay),
                }]
            }
            (ClaimKind::PeerSlot, ClaimOutcome::Error(description)) => {
                vec![Effect::Emit(NsEvent::Error { description })]
            }
        }
    }

    // ── Dials ──────────────────────────────────────────────────────────

    pub fn handle_dial(
        &mut self,
        kind: DialKind,
        outcome: Result<ChannelId, String>,
    ) -> Vec<Effect> {
        match kind {
            DialKind::Join { level, attempt } => {
                if self.role != (Role::Joining { level, attempt }) {
                    // Superseded attempt; drop a late channel if one opened.
                    return match outcome {
                        Ok(ch) => vec![Effect::Close { channel: ch }],
                        Err(_) => Vec::new(),
                    };
                }
                match outcome {
                    Ok(ch) => self.become_peer(level, ch),
                    Err(_) => self.join_failed(level, attempt),
                }
            }
            DialKind::Monitor => match outcome {
                Ok(ch) => {
                    let mut effects = vec![Effect::Close { channel: ch }];
                    effects.extend(self.monitor_result(true));
                    effects
                }
                Err(_) => self.monitor_result(false),
            },
            DialKind::SlotProbe => match outcome {
                Ok(ch) => {
                    if matches!(self.role, Role::Router { .. }) {
                        // A peer is waiting on the slot; welcome it and keep
                        // the channel for its checkin.
                        vec![Effect::Send {
                            channel: ch,
                            frame: Frame::ReverseWelcome {},
                        }]
                    } else {
                        vec![Effect::Close { channel: ch }]
                    }
                }
                Err(_) => Vec::new(),
            },
        }
    }

    // ── Frames ─────────────────────────────────────────────────────────

    pub fn handle_frame(
        &mut self,
        channel: ChannelId,
        frame: Frame,
        store: &mut ContactStore,
        now: u64,
    ) -> Vec<Effect> {
        match frame {
            Frame::Checkin {
                discovery_id,
                friendly_name,
                public_key,
            } => self.handle_checkin(channel, discovery_id, friendly_name, public_key, store, now),
            Frame::Registry { peers } => {
                if !matches!(self.role, Role::Peer { .. }) {
                    return Vec::new();
                }
                let observed = self
                    .registry
                    .merge_broadcast(&peers, &self.cfg, store, now);
                let mut effects: Vec<Effect> = observed
                    .into_iter()
                    .map(|(persistent_id, public_key)| {
                        Effect::Emit(NsEvent::PublicKeyObserved {
                            persistent_id,
                            public_key,
                        })
                    })
                    .collect();
                effects.extend(self.rendezvous_candidates());
                effects.push(Effect::Emit(NsEvent::PeersUpdated(
                    self.registry.summaries(),
                )));
                effects
            }
            Frame::Ping {} => vec![Effect::Send {
                channel,
                frame: Frame::Pong {},
            }],
            Frame::Pong {} => {
                self.registry.touch_by_channel(channel, now);
                Vec::new()
            }
            Frame::Migrate { level } => {
                if !matches!(self.role, Role::Peer { .. }) {
                    return Vec::new();
                }
                self.migrate_target = Some(level);
                let delay = self
                    .rng
                    .gen_range(0..=self.timings.migrate_jitter_max.as_millis() as u64);
                vec![Effect::Arm {
                    timer: TimerKind::MigrateJitter,
                    after: Duration::from_millis(delay),
                }]
            }
            Frame::ReverseWelcome {} => {
                let Role::PeerSlot { level } = self.role else {
                    return Vec::new();
                };
                // The router reached us through our slot; the channel becomes
                // our router channel and the slot is freed for the next peer.
                self.slot_active = false;
                let mut effects = vec![
                    Effect::Release(ClaimKind::PeerSlot),
                    Effect::Disarm(TimerKind::SlotWindow),
                    Effect::Disarm(TimerKind::SlotRetry),
                ];
                effects.extend(self.become_peer(level, channel));
                effects
            }
            _ => Vec::new(),
        }
    }

    pub fn handle_channel_closed(&mut self, channel: ChannelId, _now: u64) -> Vec<Effect> {
        if self.router_channel == Some(channel) {
            self.router_channel = None;
            if matches!(self.role, Role::Peer { .. }) {
                // Spread concurrent re-elections before restarting from L1.
                let delay = self
                    .rng
                    .gen_range(0..=self.timings.failover_jitter_max.as_millis() as u64);
                return vec![Effect::Arm {
                    timer: TimerKind::FailoverJitter,
                    after: Duration::from_millis(delay),
                }];
            }
            return Vec::new();
        }
        if matches!(self.role, Role::Router { .. }) {
            if self.registry.remove_by_channel(channel).is_some() {
                let mut effects = self.broadcast_registry();
                effects.push(Effect::Emit(NsEvent::PeersUpdated(
                    self.registry.summaries(),
                )));
                return effects;
            }
        }
        Vec::new()
    }

    // ── Timers ─────────────────────────────────────────────────────────

    pub fn handle_timer(&mut self, timer: TimerKind, now: u64) -> Vec<Effect> {
        match timer {
            TimerKind::Ping => self.ping_cycle(now),
            TimerKind::Monitor => {
                if self.role.level() > 1
                    && matches!(self.role, Role::Peer { .. } | Role::Router { .. })
                {
                    vec![
                        Effect::Dial(DialKind::Monitor),
                        Effect::Arm {
                            timer: TimerKind::Monitor,
                            after: self.timings.monitor,
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TimerKind::SlotProbe => {
                if matches!(self.role, Role::Router { .. }) {
                    vec![
                        Effect::Dial(DialKind::SlotProbe),
                        Effect::Arm {
                            timer: TimerKind::SlotProbe,
                            after: self.timings.slot_probe,
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TimerKind::SlotWindow => {
                let Role::PeerSlot { level } = self.role else {
                    return Vec::new();
                };
                // No probe reached us inside the window; escalate.
                self.slot_active = false;
                let mut effects = vec![Effect::Release(ClaimKind::PeerSlot)];
                effects.extend(self.elect(level + 1));
                effects
            }
            TimerKind::SlotRetry => {
                if matches!(self.role, Role::PeerSlot { .. }) {
                    vec![Effect::Claim(ClaimKind::PeerSlot)]
                } else {
                    Vec::new()
                }
            }
            TimerKind::JoinTimeout => {
                let Role::Joining { level, attempt } = self.role else {
                    return Vec::new();
                };
                self.join_failed(level, attempt)
            }
            TimerKind::JoinRetry => {
                let Role::Joining { level, attempt } = self.role else {
                    return Vec::new();
                };
                vec![
                    Effect::Dial(DialKind::Join { level, attempt }),
                    Effect::Arm {
                        timer: TimerKind::JoinTimeout,
                        after: self.timings.join_timeout,
                    },
                ]
            }
            TimerKind::FailoverJitter => {
                if !matches!(self.role, Role::Peer { .. }) {
                    return Vec::new();
                }
                let mut effects = self.teardown(true);
                effects.extend(self.elect(1));
                effects
            }
            TimerKind::MigrateJitter | TimerKind::MigrateLinger => {
                let target = self.migrate_target.take().unwrap_or(1);
                let mut effects = self.teardown(true);
                effects.extend(self.elect(target));
                effects
            }
        }
    }

    // ── Internal transitions ───────────────────────────────────────────

    fn elect(&mut self, level: u8) -> Vec<Effect> {
        if level > self.timings.max_level {
            self.role = Role::Idle;
            return vec![Effect::Emit(NsEvent::DiscoveryOffline), Effect::Stop];
        }
        self.role = Role::Electing { level };
        vec![Effect::Claim(ClaimKind::Router(level))]
    }

    fn become_router(&mut self, level: u8) -> Vec<Effect> {
        self.role = Role::Router { level };
        self.registry.reset_to_self();
        let mut effects = vec![
            Effect::Arm {
                timer: TimerKind::Ping,
                after: self.timings.ping,
            },
            Effect::Arm {
                timer: TimerKind::SlotProbe,
                after: self.timings.slot_probe,
            },
        ];
        if level > 1 {
            effects.push(Effect::Arm {
                timer: TimerKind::Monitor,
                after: self.timings.monitor,
            });
        }
        if !self.discovery_claimed {
            effects.push(Effect::Claim(ClaimKind::Discovery));
        }
        effects.push(Effect::Emit(NsEvent::RoleChanged {
            router: true,
            level,
        }));
        effects.push(Effect::Emit(NsEvent::PeersUpdated(
            self.registry.summaries(),
        )));
        effects
    }

    fn start_join(&mut self, level: u8, attempt: u32) -> Vec<Effect> {
        self.role = Role::Joining { level, attempt };
        vec![
            Effect::Dial(DialKind::Join { level, attempt }),
            Effect::Arm {
                timer: TimerKind::JoinTimeout,
                after: self.timings.join_timeout,
            },
        ]
    }

    fn join_failed(&mut self, level: u8, attempt: u32) -> Vec<Effect> {
        let mut effects = vec![Effect::Disarm(TimerKind::JoinTimeout)];
        let next = attempt + 1;
        if next < self.timings.max_join_attempts {
            self.role = Role::Joining {
                level,
                attempt: next,
            };
            effects.push(Effect::Arm {
                timer: TimerKind::JoinRetry,
                after: self.timings.join_retry,
            });
        } else {
            // Router claimed but unreachable from here, typically our NAT.
            // Offer it a path back to us instead.
            self.role = Role::PeerSlot { level };
            effects.push(Effect::Claim(ClaimKind::PeerSlot));
        }
        effects
    }

    fn become_peer(&mut self, level: u8, channel: ChannelId) -> Vec<Effect> {
        self.role = Role::Peer { level };
        self.router_channel = Some(channel);
        let mut effects = vec![
            Effect::Disarm(TimerKind::JoinTimeout),
            Effect::Send {
                channel,
                frame: self.checkin_frame(),
            },
        ];
        if !self.discovery_claimed {
            effects.push(Effect::Claim(ClaimKind::Discovery));
        }
        if level > 1 {
            effects.push(Effect::Arm {
                timer: TimerKind::Monitor,
                after: self.timings.monitor,
            });
        }
        effects.push(Effect::Emit(NsEvent::RoleChanged {
            router: false,
            level,
        }));
        effects
    }

    fn monitor_result(&mut self, l1_reachable: bool) -> Vec<Effect> {
        match self.role {
            Role::Peer { level } if level > 1 && l1_reachable => {
                // L1 is alive again; drift back down after a short jitter.
                self.migrate_target = Some(1);
                let delay = self
                    .rng
                    .gen_range(0..=self.timings.migrate_jitter_max.as_millis() as u64);
                vec![Effect::Arm {
                    timer: TimerKind::MigrateJitter,
                    after: Duration::from_millis(delay),
                }]
            }
            Role::Router { level } if level > 1 => {
                // Whether L1 answered (migrate there) or refused (reclaim it
                // ourselves), this namespace collapses back to L1. Peers get
                // a head start before our own teardown.
                self.migrate_target = Some(1);
                let mut effects: Vec<Effect> = self
                    .registry
                    .peer_channels()
                    .into_iter()
                    .map(|channel| Effect::Send {
                        channel,
                        frame: Frame::Migrate { level: 1 },
                    })
                    .collect();
                effects.push(Effect::Arm {
                    timer: TimerKind::MigrateLinger,
                    after: self.timings.migrate_linger,
                });
                effects
            }
            _ => Vec::new(),
        }
    }

    fn handle_checkin(
        &mut self,
        channel: ChannelId,
        discovery_id: String,
        friendly_name: String,
        public_key: Option<String>,
        store: &mut ContactStore,
        now: u64,
    ) -> Vec<Effect> {
        if !matches!(self.role, Role::Router { .. }) {
            return Vec::new();
        }
        let mut effects = Vec::new();

        // Resolve to a local contact: public key first, discovery uuid second.
        let resolved = public_key
            .as_deref()
            .and_then(|pk| store.find_by_public_key(pk, None))
            .or_else(|| {
                self.cfg
                    .uuid_of(&discovery_id)
                    .and_then(|uuid| store.find_by_discovery_uuid(&uuid))
            });

        if let Some(pid) = &resolved {
            if let Some(rec) = store.get_mut(pid) {
                rec.on_network = true;
                rec.network_discovery_id = Some(discovery_id.clone());
                rec.last_seen = now;
            }
            if let Some(pk) = &public_key {
                if store.get(pid).map(|r| r.public_key.is_none()).unwrap_or(false)
                    && store.record_public_key(pid, pk) == KeyOutcome::Recorded
                {
                    effects.push(Effect::Emit(NsEvent::PublicKeyObserved {
                        persistent_id: pid.clone(),
                        public_key: pk.clone(),
                    }));
                }
            }
        }

        let evicted = self.registry.insert(RegistryEntry {
            discovery_id: discovery_id.clone(),
            friendly_name,
            last_seen: now,
            channel: Some(channel),
            is_me: false,
            persistent_id: resolved,
            public_key: public_key.clone(),
        });
        for ch in evicted {
            effects.push(Effect::Close { channel: ch });
        }

        effects.extend(self.broadcast_registry());
        effects.extend(self.rendezvous_candidates());
        effects.push(Effect::Emit(NsEvent::PeersUpdated(
            self.registry.summaries(),
        )));
        effects
    }

    fn ping_cycle(&mut self, now: u64) -> Vec<Effect> {
        if !matches!(self.role, Role::Router { .. }) {
            return Vec::new();
        }
        let mut effects: Vec<Effect> = self
            .registry
            .peer_channels()
            .into_iter()
            .map(|channel| Effect::Send {
                channel,
                frame: Frame::Ping {},
            })
            .collect();

        let evicted = self
            .registry
            .evict_stale(now, self.timings.peer_ttl.as_millis() as u64);
        if !evicted.is_empty() {
            for entry in &evicted {
                if let Some(ch) = entry.channel {
                    effects.push(Effect::Close { channel: ch });
                }
            }
            effects.extend(self.broadcast_registry());
            effects.push(Effect::Emit(NsEvent::PeersUpdated(
                self.registry.summaries(),
            )));
        }

        effects.push(Effect::Arm {
            timer: TimerKind::Ping,
            after: self.timings.ping,
        });
        effects
    }

    fn broadcast_registry(&self) -> Vec<Effect> {
        let peers = self.registry.to_wire();
        self.registry
            .peer_channels()
            .into_iter()
            .map(|channel| Effect::Send {
                channel,
                frame: Frame::Registry {
                    peers: peers.clone(),
                },
            })
            .collect()
    }

    /// Non-self entries carrying a public key, for the rendezvous scheduler.
    fn rendezvous_candidates(&self) -> Vec<Effect> {
        if !self.cfg.is_rendezvous() {
            return Vec::new();
        }
        self.registry
            .summaries()
            .into_iter()
            .filter(|s| !s.is_me)
            .filter_map(|s| {
                s.public_key.map(|public_key| {
                    Effect::Emit(NsEvent::RendezvousCandidate {
                        discovery_id: s.discovery_id,
                        public_key,
                    })
                })
            })
            .collect()
    }

    fn teardown(&mut self, keep_discovery: bool) -> Vec<Effect> {
        let mut effects = vec![Effect::CloseAll, Effect::DisarmAll];
        if self.slot_active {
            effects.push(Effect::Release(ClaimKind::PeerSlot));
            self.slot_active = false;
        }
        if let Role::Router { level } = self.role {
            effects.push(Effect::Release(ClaimKind::Router(level)));
        }
        if !keep_discovery && self.discovery_claimed {
            effects.push(Effect::Release(ClaimKind::Discovery));
            self.discovery_claimed = false;
        }
        self.router_channel = None;
        self.migrate_target = None;
        self.registry.reset_to_self();
        self.role = Role::Idle;
        effects
    }

    fn checkin_frame(&self) -> Frame {
        Frame::Checkin {
            discovery_id: self.self_discovery_id(),
            friendly_name: self.friendly_name.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactRecord;
    use crate::namespace::config::NamespaceKind;

    fn state() -> NamespaceState {
        let cfg = NamespaceConfig::new(
            "pfx",
            NamespaceKind::Public {
                ip: "203.0.113.7".parse().unwrap(),
            },
        );
        NamespaceState::new(
            cfg,
            Timings::default(),
            DiscoveryUuid::generate(),
            "alice".into(),
            Some("KA".into()),
            Some(7),
            1_000,
        )
    }

    fn has_claim(effects: &[Effect], kind: ClaimKind) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Claim(k) if *k == kind))
    }

    fn has_arm(effects: &[Effect], timer: TimerKind) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Arm { timer: t, .. } if *t == timer))
    }

    fn sent_frames(effects: &[Effect]) -> Vec<&Frame> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { frame, .. } => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn election_granted_becomes_router() {
        let mut s = state();
        let effects = s.start();
        assert!(has_claim(&effects, ClaimKind::Router(1)));
        assert_eq!(s.role(), Role::Electing { level: 1 });

        let effects = s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        assert_eq!(s.role(), Role::Router { level: 1 });
        assert!(has_arm(&effects, TimerKind::Ping));
        assert!(has_arm(&effects, TimerKind::SlotProbe));
        assert!(!has_arm(&effects, TimerKind::Monitor), "no monitor at L1");
        assert!(has_claim(&effects, ClaimKind::Discovery));
    }

    #[test]
    fn election_taken_joins() {
        let mut s = state();
        s.start();
        let effects = s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        assert_eq!(s.role(), Role::Joining { level: 1, attempt: 0 });
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Dial(DialKind::Join { level: 1, attempt: 0 }))));
        assert!(has_arm(&effects, TimerKind::JoinTimeout));
    }

    #[test]
    fn join_success_sends_checkin() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        let effects = s.handle_dial(DialKind::Join { level: 1, attempt: 0 }, Ok(ChannelId(9)));

        assert_eq!(s.role(), Role::Peer { level: 1 });
        let frames = sent_frames(&effects);
        assert!(matches!(frames[0], Frame::Checkin { .. }));
        assert!(has_claim(&effects, ClaimKind::Discovery));
    }

    #[test]
    fn three_join_failures_fall_back_to_slot() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);

        // Attempt 0 and 1 fail with a retry each
        for expected_attempt in 1..MAX_JOIN_ATTEMPTS {
            let effects = s.handle_timer(TimerKind::JoinTimeout, 0);
            assert_eq!(
                s.role(),
                Role::Joining { level: 1, attempt: expected_attempt }
            );
            assert!(has_arm(&effects, TimerKind::JoinRetry));
            let effects = s.handle_timer(TimerKind::JoinRetry, 0);
            assert!(has_arm(&effects, TimerKind::JoinTimeout));
        }

        // Final failure claims the reverse-connect slot
        let effects = s.handle_timer(TimerKind::JoinTimeout, 0);
        assert_eq!(s.role(), Role::PeerSlot { level: 1 });
        assert!(has_claim(&effects, ClaimKind::PeerSlot));
    }

    #[test]
    fn slot_window_escalates_level() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        for _ in 0..MAX_JOIN_ATTEMPTS {
            s.handle_timer(TimerKind::JoinTimeout, 0);
            s.handle_timer(TimerKind::JoinRetry, 0);
        }
        assert_eq!(s.role(), Role::PeerSlot { level: 1 });

        let effects = s.handle_claim(ClaimKind::PeerSlot, ClaimOutcome::Granted);
        assert!(has_arm(&effects, TimerKind::SlotWindow));

        let effects = s.handle_timer(TimerKind::SlotWindow, 0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Release(ClaimKind::PeerSlot))));
        assert!(has_claim(&effects, ClaimKind::Router(2)));
        assert_eq!(s.role(), Role::Electing { level: 2 });
    }

    #[test]
    fn reverse_welcome_adopts_channel() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        for _ in 0..MAX_JOIN_ATTEMPTS {
            s.handle_timer(TimerKind::JoinTimeout, 0);
            s.handle_timer(TimerKind::JoinRetry, 0);
        }
        s.handle_claim(ClaimKind::PeerSlot, ClaimOutcome::Granted);

        let mut store = ContactStore::new();
        let effects = s.handle_frame(ChannelId(4), Frame::ReverseWelcome {}, &mut store, 0);

        assert_eq!(s.role(), Role::Peer { level: 1 });
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Release(ClaimKind::PeerSlot))));
        assert!(matches!(sent_frames(&effects)[0], Frame::Checkin { .. }));
    }

    #[test]
    fn checkin_registers_and_broadcasts() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);

        let mut store = ContactStore::new();
        let effects = s.handle_frame(
            ChannelId(3),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-ffffffffffffffffffffffffffffffff".into(),
                friendly_name: "bob".into(),
                public_key: Some("KB".into()),
            },
            &mut store,
            2_000,
        );

        assert_eq!(s.registry().len(), 2, "peers here = 2");
        let frames = sent_frames(&effects);
        assert!(
            frames.iter().any(|f| matches!(f, Frame::Registry { peers } if peers.len() == 2)),
            "registry broadcast to the new peer"
        );
    }

    #[test]
    fn checkin_dedupes_by_public_key() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        let mut store = ContactStore::new();

        s.handle_frame(
            ChannelId(3),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
                friendly_name: "bob".into(),
                public_key: Some("KB".into()),
            },
            &mut store,
            2_000,
        );
        // Same public key from a new discovery id (regenerated device)
        let effects = s.handle_frame(
            ChannelId(4),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
                friendly_name: "bob".into(),
                public_key: Some("KB".into()),
            },
            &mut store,
            3_000,
        );

        assert_eq!(s.registry().len(), 2, "old entry evicted");
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Close { channel: ChannelId(3) })));
    }

    #[test]
    fn router_ping_evicts_stale_entries() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        let mut store = ContactStore::new();
        s.handle_frame(
            ChannelId(3),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-cccccccccccccccccccccccccccccccc".into(),
                friendly_name: "bob".into(),
                public_key: None,
            },
            &mut store,
            1_000,
        );

        // Within TTL: ping only
        let effects = s.handle_timer(TimerKind::Ping, 50_000);
        assert!(sent_frames(&effects).iter().any(|f| matches!(f, Frame::Ping {})));
        assert_eq!(s.registry().len(), 2);

        // Past TTL + grace: evicted and rebroadcast
        let effects = s.handle_timer(TimerKind::Ping, 1_000 + 100_001);
        assert_eq!(s.registry().len(), 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Close { channel: ChannelId(3) })));
    }

    #[test]
    fn pong_refreshes_last_seen() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        let mut store = ContactStore::new();
        s.handle_frame(
            ChannelId(3),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-dddddddddddddddddddddddddddddddd".into(),
                friendly_name: "bob".into(),
                public_key: None,
            },
            &mut store,
            1_000,
        );

        s.handle_frame(ChannelId(3), Frame::Pong {}, &mut store, 80_000);
        // last_seen refreshed at 80s, so a sweep at 120s keeps the entry
        s.handle_timer(TimerKind::Ping, 120_000);
        assert_eq!(s.registry().len(), 2);
    }

    #[test]
    fn router_loss_triggers_jittered_failover() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        s.handle_dial(DialKind::Join { level: 1, attempt: 0 }, Ok(ChannelId(9)));

        let effects = s.handle_channel_closed(ChannelId(9), 0);
        assert!(has_arm(&effects, TimerKind::FailoverJitter));

        let effects = s.handle_timer(TimerKind::FailoverJitter, 0);
        assert!(effects.iter().any(|e| matches!(e, Effect::CloseAll)));
        assert!(has_claim(&effects, ClaimKind::Router(1)));
        assert_eq!(s.role(), Role::Electing { level: 1 });
        assert_eq!(s.registry().len(), 1, "only the self entry survives");
    }

    #[test]
    fn migrate_frame_rejoins_at_target_level() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        s.handle_dial(DialKind::Join { level: 1, attempt: 0 }, Ok(ChannelId(9)));

        let mut store = ContactStore::new();
        let effects = s.handle_frame(ChannelId(9), Frame::Migrate { level: 1 }, &mut store, 0);
        assert!(has_arm(&effects, TimerKind::MigrateJitter));

        let effects = s.handle_timer(TimerKind::MigrateJitter, 0);
        assert!(has_claim(&effects, ClaimKind::Router(1)));
    }

    #[test]
    fn router_above_l1_collapses_on_monitor() {
        let mut s = state();
        // Become router at L2
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        for _ in 0..MAX_JOIN_ATTEMPTS {
            s.handle_timer(TimerKind::JoinTimeout, 0);
            s.handle_timer(TimerKind::JoinRetry, 0);
        }
        s.handle_claim(ClaimKind::PeerSlot, ClaimOutcome::Granted);
        s.handle_timer(TimerKind::SlotWindow, 0);
        let effects = s.handle_claim(ClaimKind::Router(2), ClaimOutcome::Granted);
        assert_eq!(s.role(), Role::Router { level: 2 });
        assert!(has_arm(&effects, TimerKind::Monitor), "monitor runs above L1");

        // Register one peer so the migrate broadcast has a destination
        let mut store = ContactStore::new();
        s.handle_frame(
            ChannelId(5),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".into(),
                friendly_name: "bob".into(),
                public_key: None,
            },
            &mut store,
            0,
        );

        // Monitor probe opened: L1 lives; everyone migrates
        let effects = s.handle_dial(DialKind::Monitor, Ok(ChannelId(6)));
        assert!(sent_frames(&effects)
            .iter()
            .any(|f| matches!(f, Frame::Migrate { level: 1 })));
        assert!(has_arm(&effects, TimerKind::MigrateLinger));

        let effects = s.handle_timer(TimerKind::MigrateLinger, 0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Release(ClaimKind::Router(2)))));
        assert!(has_claim(&effects, ClaimKind::Router(1)));
    }

    #[test]
    fn level_exhaustion_goes_offline() {
        let mut s = state();
        s.start();
        // Exhaust every level through the slot path
        for level in 1..=MAX_LEVEL {
            s.handle_claim(ClaimKind::Router(level), ClaimOutcome::Taken);
            for _ in 0..MAX_JOIN_ATTEMPTS {
                s.handle_timer(TimerKind::JoinTimeout, 0);
                s.handle_timer(TimerKind::JoinRetry, 0);
            }
            s.handle_claim(ClaimKind::PeerSlot, ClaimOutcome::Granted);
            let effects = s.handle_timer(TimerKind::SlotWindow, 0);
            if level == MAX_LEVEL {
                assert!(effects
                    .iter()
                    .any(|e| matches!(e, Effect::Emit(NsEvent::DiscoveryOffline))));
                assert!(effects.iter().any(|e| matches!(e, Effect::Stop)));
            }
        }
    }

    #[test]
    fn pause_keeps_discovery_claim() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        s.handle_claim(ClaimKind::Discovery, ClaimOutcome::Granted);

        let effects = s.pause();
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::Release(ClaimKind::Discovery))),
            "pause retains the discovery claim"
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Release(ClaimKind::Router(1)))));

        let effects = s.resume();
        assert!(has_claim(&effects, ClaimKind::Router(1)));
        // Discovery already held; becoming router again must not re-claim it
        let effects = s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        assert!(!has_claim(&effects, ClaimKind::Discovery));
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        s.handle_claim(ClaimKind::Discovery, ClaimOutcome::Granted);

        let effects = s.shutdown();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Release(ClaimKind::Discovery))));
        assert!(effects.iter().any(|e| matches!(e, Effect::Stop)));
    }

    #[test]
    fn name_update_rebroadcasts() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Granted);
        let mut store = ContactStore::new();
        s.handle_frame(
            ChannelId(3),
            Frame::Checkin {
                discovery_id: "pfx-203-0-113-7-abababababababababababababababab".into(),
                friendly_name: "bob".into(),
                public_key: None,
            },
            &mut store,
            0,
        );

        let effects = s.set_name("alice-renamed", 1);
        let frames = sent_frames(&effects);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::Registry { peers } if peers.iter().any(|p| p.friendly_name == "alice-renamed")
        )));
    }

    #[test]
    fn stale_join_channel_is_closed() {
        let mut s = state();
        s.start();
        s.handle_claim(ClaimKind::Router(1), ClaimOutcome::Taken);
        // Timeout moves us to attempt 1; the late channel from attempt 0 must be dropped
        s.handle_timer(TimerKind::JoinTimeout, 0);
        let effects = s.handle_dial(DialKind::Join { level: 1, attempt: 0 }, Ok(ChannelId(8)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Close { channel: ChannelId(8) })));
        assert_eq!(s.role(), Role::Joining { level: 1, attempt: 1 });
    }
}
