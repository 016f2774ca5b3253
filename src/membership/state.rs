//! Membership State Machine
//!
//! `ClusterState` is everything the protocol tasks share behind the single
//! service lock: the registry, the broadcast queue, the probe ring and the
//! random source. All membership transitions go through `alive_node`,
//! `suspect_node` and `dead_node`, whether the fact came from the prober,
//! from gossip or from a push/pull, so the paths cannot disagree.
//!
//! Transitions never perform I/O. They return `Effects` (events to publish and
//! suspicion timers to start) for the caller to act on after the lock is
//! released.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use super::broadcast::BroadcastQueue;
use super::config::Config;
use super::protocol::{
    Message, PACKET_OVERHEAD, PART_OVERHEAD, PushNodeState, encode_message,
};
use super::registry::Registry;
use super::suspicion::{Suspicion, SuspicionTimeout, retransmit_limit};
use super::types::{MembershipEvent, Node, NodeName, NodeState, ProtocolVersion, State};

/// The leave broadcast is retransmitted this many times more than a normal fact.
const LEAVE_RETRANSMIT_FACTOR: u32 = 3;

/// A suspicion timer the caller must start.
#[derive(Debug, Clone)]
pub struct SuspicionTimer {
    pub node: NodeName,
    pub incarnation: u64,
    pub wake: Arc<Notify>,
}

/// Side effects of a transition, applied outside the lock.
#[derive(Debug, Default)]
pub struct Effects {
    pub events: Vec<MembershipEvent>,
    pub timers: Vec<SuspicionTimer>,
}

impl Effects {
    pub fn extend(&mut self, other: Effects) {
        self.events.extend(other.events);
        self.timers.extend(other.timers);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.timers.is_empty()
    }
}

pub struct ClusterState {
    pub registry: Registry,
    pub broadcasts: BroadcastQueue,
    config: Config,
    probe_order: Vec<NodeName>,
    probe_cursor: usize,
    rng: ChaCha8Rng,
}

impl ClusterState {
    /// Builds the state with the local node registered Alive at incarnation 0.
    pub fn new(local: Node, config: &Config) -> Self {
        let seed = config.rng_seed.unwrap_or_else(rand::random);
        let max_payload = config.packet_size - PACKET_OVERHEAD - PART_OVERHEAD;

        Self {
            registry: Registry::new(local, 0),
            broadcasts: BroadcastQueue::new(max_payload),
            config: config.clone(),
            probe_order: Vec::new(),
            probe_cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn local_version(&self) -> ProtocolVersion {
        self.registry.local_state().node.version
    }

    pub fn local_incarnation(&self) -> u64 {
        self.registry.local_state().incarnation
    }

    /// Raises the local incarnation and announces the local node as Alive.
    pub fn announce_local(&mut self) {
        let local = self.registry.local_state_mut();
        local.incarnation += 1;
        let incarnation = local.incarnation;
        let node = local.node.clone();

        info!("Announcing {} (inc={})", node.name, incarnation);
        self.queue_fact(&node.name.clone(), Message::Alive { incarnation, node });
    }

    /// Answers an accusation about the local node with a higher incarnation.
    fn refute(&mut self, accused_incarnation: u64) {
        let local = self.registry.local_state_mut();
        local.incarnation = local.incarnation.max(accused_incarnation) + 1;
        let incarnation = local.incarnation;
        let node = local.node.clone();

        warn!(
            "Refuting accusation at inc={} with inc={}",
            accused_incarnation, incarnation
        );
        self.queue_fact(&node.name.clone(), Message::Alive { incarnation, node });
    }

    fn queue_fact(&mut self, node: &NodeName, msg: Message) {
        let transmits = retransmit_limit(self.config.retransmit_mult, self.registry.len());

        let encoded = match encode_message(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode broadcast about {}: {}", node, e);
                return;
            }
        };

        if let Err(e) = self.broadcasts.queue_fact(node.clone(), encoded, transmits) {
            warn!("Dropping broadcast about {}: {}", node, e);
        }
    }

    fn suspicion_timeout(&self) -> SuspicionTimeout {
        SuspicionTimeout::new(
            self.config.suspicion_mult,
            self.config.suspicion_max_timeout_mult,
            self.config.probe_interval,
            self.config.indirect_checks,
            self.registry.len(),
        )
    }

    pub fn alive_node(&mut self, incarnation: u64, node: Node, now: Instant) -> Effects {
        let mut effects = Effects::default();

        if self.registry.is_local(&node.name) {
            let local = self.registry.local_state();
            // A higher incarnation about ourselves comes from a previous life.
            if local.state != State::Left && incarnation > local.incarnation {
                self.refute(incarnation);
            }
            return effects;
        }

        if !self.local_version().overlaps(&node.version) {
            warn!(
                "Ignoring {} with incompatible protocol range [{}, {}]",
                node.name, node.version.min, node.version.max
            );
            return effects;
        }

        let previous = match self.registry.get_mut(&node.name) {
            None => None,
            Some(existing) => {
                if incarnation <= existing.incarnation {
                    return effects;
                }

                let previous = (existing.state, existing.node != node);
                existing.node = node.clone();
                existing.incarnation = incarnation;
                existing.suspicion = None;
                if existing.state != State::Alive {
                    existing.state = State::Alive;
                    existing.state_change = now;
                }
                Some(previous)
            }
        };

        match previous {
            None => {
                info!(
                    "Discovered new member {} at {} (inc={})",
                    node.name, node.gossip_addr, incarnation
                );
                self.registry
                    .insert(NodeState::new(node.clone(), State::Alive, incarnation));
                effects.events.push(MembershipEvent::NodeJoined(node.clone()));
            }
            Some((state, _)) if state.is_terminal() => {
                info!("{} is back (inc={})", node.name, incarnation);
                effects.events.push(MembershipEvent::NodeJoined(node.clone()));
            }
            Some((State::Suspect, changed)) => {
                info!("{} refuted suspicion (inc={})", node.name, incarnation);
                if changed {
                    effects.events.push(MembershipEvent::NodeUpdated(node.clone()));
                }
            }
            Some((_, changed)) => {
                if changed {
                    debug!("{} updated (inc={})", node.name, incarnation);
                    effects.events.push(MembershipEvent::NodeUpdated(node.clone()));
                }
            }
        }

        self.queue_fact(&node.name.clone(), Message::Alive { incarnation, node });
        effects
    }

    pub fn suspect_node(
        &mut self,
        incarnation: u64,
        name: &NodeName,
        from: &NodeName,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();

        if self.registry.is_local(name) {
            let local = self.registry.local_state();
            if local.state != State::Left && incarnation >= local.incarnation {
                self.refute(incarnation);
            }
            return effects;
        }

        let timeout = self.suspicion_timeout();
        let Some(existing) = self.registry.get_mut(name) else {
            return effects;
        };

        if incarnation < existing.incarnation {
            return effects;
        }

        match existing.state {
            State::Alive => {
                let suspicion = Suspicion::new(from.clone(), timeout, now);
                effects.timers.push(SuspicionTimer {
                    node: name.clone(),
                    incarnation,
                    wake: suspicion.waker(),
                });

                existing.state = State::Suspect;
                existing.incarnation = incarnation;
                existing.state_change = now;
                existing.suspicion = Some(suspicion);

                info!("{} suspected by {} (inc={})", name, from, incarnation);
                effects.events.push(MembershipEvent::NodeSuspected(name.clone()));
            }
            State::Suspect => {
                let confirmed = existing
                    .suspicion
                    .as_mut()
                    .map(|suspicion| suspicion.confirm(from.clone()))
                    .unwrap_or(false);
                if !confirmed {
                    return effects;
                }
                debug!(
                    "{} suspicion corroborated by {} ({} confirmations)",
                    name,
                    from,
                    existing.confirmations()
                );
            }
            State::Dead | State::Left => return effects,
        }

        let incarnation = existing.incarnation;
        self.queue_fact(
            name,
            Message::Suspect {
                incarnation,
                node: name.clone(),
                from: from.clone(),
            },
        );
        effects
    }

    pub fn dead_node(
        &mut self,
        incarnation: u64,
        name: &NodeName,
        from: &NodeName,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let leaving = name == from;

        if self.registry.is_local(name) {
            let local = self.registry.local_state();
            if local.state != State::Left && !leaving && incarnation >= local.incarnation {
                self.refute(incarnation);
            }
            return effects;
        }

        let Some(existing) = self.registry.get_mut(name) else {
            return effects;
        };

        if incarnation < existing.incarnation {
            return effects;
        }

        let next = if leaving { State::Left } else { State::Dead };
        if existing.state.is_terminal() && next <= existing.state {
            return effects;
        }

        existing.state = next;
        existing.incarnation = incarnation;
        existing.state_change = now;
        existing.suspicion = None;
        let node = existing.node.clone();

        if leaving {
            info!("{} left the cluster (inc={})", name, incarnation);
            effects.events.push(MembershipEvent::NodeLeft(node));
        } else {
            info!("{} declared dead by {} (inc={})", name, from, incarnation);
            effects.events.push(MembershipEvent::NodeFailed(node));
        }

        self.queue_fact(
            name,
            Message::Dead {
                incarnation,
                node: name.clone(),
                from: from.clone(),
            },
        );
        effects
    }

    /// Applies the transition carried by a gossip message. Other messages are
    /// not membership facts and yield no effects.
    pub fn apply_message(&mut self, msg: Message, now: Instant) -> Effects {
        match msg {
            Message::Alive { incarnation, node } => self.alive_node(incarnation, node, now),
            Message::Suspect {
                incarnation,
                node,
                from,
            } => self.suspect_node(incarnation, &node, &from, now),
            Message::Dead {
                incarnation,
                node,
                from,
            } => self.dead_node(incarnation, &node, &from, now),
            _ => Effects::default(),
        }
    }

    /// Replays a peer's full state through the gossip transitions.
    ///
    /// A remote Dead is downgraded to Suspect: the subject gets a chance to
    /// refute instead of being buried on a possibly stale report.
    pub fn merge_remote(
        &mut self,
        nodes: Vec<PushNodeState>,
        from: &NodeName,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();

        for entry in nodes {
            let name = entry.node.name.clone();
            let applied = match entry.state {
                State::Alive => self.alive_node(entry.incarnation, entry.node, now),
                State::Suspect | State::Dead => {
                    self.suspect_node(entry.incarnation, &name, from, now)
                }
                State::Left => self.dead_node(entry.incarnation, &name, &name, now),
            };
            effects.extend(applied);
        }

        effects
    }

    /// Deadline of the suspicion started at `incarnation`, if still pending.
    pub fn suspicion_deadline(&self, name: &NodeName, incarnation: u64) -> Option<Instant> {
        let state = self.registry.get(name)?;
        if state.state != State::Suspect || state.incarnation != incarnation {
            return None;
        }
        state.suspicion.as_ref().map(|s| s.deadline())
    }

    /// Declares a suspect dead once its timer has run out unrefuted.
    pub fn expire_suspicion(&mut self, name: &NodeName, incarnation: u64, now: Instant) -> Effects {
        match self.suspicion_deadline(name, incarnation) {
            Some(deadline) if deadline <= now => {
                let local = self.registry.local_name().clone();
                self.dead_node(incarnation, name, &local, now)
            }
            _ => Effects::default(),
        }
    }

    /// Marks the local node Left and queues the departure with an enlarged
    /// budget. The receiver fires once that broadcast is retired.
    pub fn leave_local(&mut self, now: Instant) -> Option<oneshot::Receiver<()>> {
        let transmits = retransmit_limit(self.config.retransmit_mult, self.registry.len())
            * LEAVE_RETRANSMIT_FACTOR;

        let local = self.registry.local_state_mut();
        if local.state == State::Left {
            return None;
        }

        local.incarnation += 1;
        local.state = State::Left;
        local.state_change = now;
        let incarnation = local.incarnation;
        let name = local.node.name.clone();

        let msg = Message::Dead {
            incarnation,
            node: name.clone(),
            from: name.clone(),
        };
        let encoded = match encode_message(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode leave broadcast: {}", e);
                return None;
            }
        };

        let (tx, rx) = oneshot::channel();
        if let Err(e) = self
            .broadcasts
            .queue_fact_notify(name, encoded, transmits, tx)
        {
            warn!("Failed to queue leave broadcast: {}", e);
            return None;
        }

        info!("Leaving cluster (inc={})", incarnation);
        Some(rx)
    }

    /// Next node to probe, walking a shuffled ring rebuilt once per cycle.
    pub fn next_probe_target(&mut self, now: Instant) -> Option<(Node, u64)> {
        let mut rebuilt = false;

        loop {
            if self.probe_cursor >= self.probe_order.len() {
                if rebuilt {
                    return None;
                }
                rebuilt = true;
                self.start_probe_cycle(now);
                if self.probe_order.is_empty() {
                    return None;
                }
            }

            let name = &self.probe_order[self.probe_cursor];
            self.probe_cursor += 1;

            if let Some(state) = self.registry.get(name) {
                if !state.state.is_terminal() && !self.registry.is_local(name) {
                    return Some((state.node.clone(), state.incarnation));
                }
            }
        }
    }

    fn start_probe_cycle(&mut self, now: Instant) {
        let reaped = self.registry.reap(self.config.dead_node_retention, now);
        for name in &reaped {
            debug!("Reaped {} from the registry", name);
        }

        self.probe_order = self
            .registry
            .peers(|state| !state.state.is_terminal())
            .into_iter()
            .map(|state| state.name().clone())
            .collect();
        self.probe_order.shuffle(&mut self.rng);
        self.probe_cursor = 0;
    }

    /// Up to `count` Alive peers other than `target` to relay a probe.
    pub fn indirect_helpers(&mut self, target: &NodeName, count: usize) -> Vec<SocketAddr> {
        let candidates = self
            .registry
            .peers(|state| state.state == State::Alive && state.name() != target);

        candidates
            .choose_multiple(&mut self.rng, count)
            .map(|state| state.node.gossip_addr)
            .collect()
    }

    /// Up to `count` random gossip recipients. Recently dead nodes are still
    /// included so they learn about, and can refute, their death.
    pub fn gossip_targets(&mut self, count: usize, now: Instant) -> Vec<SocketAddr> {
        let dead_window = self.config.gossip_to_the_dead_time;
        let candidates = self.registry.peers(|state| match state.state {
            State::Alive | State::Suspect => true,
            State::Dead => now.saturating_duration_since(state.state_change) < dead_window,
            State::Left => false,
        });

        candidates
            .choose_multiple(&mut self.rng, count)
            .map(|state| state.node.gossip_addr)
            .collect()
    }

    /// A random Alive peer to run anti-entropy with.
    pub fn push_pull_target(&mut self) -> Option<SocketAddr> {
        let candidates = self.registry.peers(|state| state.state == State::Alive);
        candidates
            .choose(&mut self.rng)
            .map(|state| state.node.stream_addr)
    }

    pub fn has_live_peers(&self) -> bool {
        !self
            .registry
            .peers(|state| !state.state.is_terminal())
            .is_empty()
    }

    /// Every registry entry, for an outgoing push/pull.
    pub fn snapshot(&self) -> Vec<PushNodeState> {
        self.registry
            .iter()
            .map(|state| PushNodeState {
                node: state.node.clone(),
                incarnation: state.incarnation,
                state: state.state,
            })
            .collect()
    }

    /// Queues the application payloads and drains gossip for one packet.
    ///
    /// `limit` is the room left in the packet for gossip parts.
    pub fn fill_packet(&mut self, user: Vec<Vec<u8>>, limit: usize) -> Vec<Vec<u8>> {
        for payload in user {
            let encoded = match encode_message(&Message::User { payload }) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("Failed to encode user broadcast: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.broadcasts.queue_unique(encoded, 1) {
                warn!("Rejected user broadcast: {}", e);
            }
        }

        self.broadcasts.get_broadcasts(PART_OVERHEAD, limit)
    }

    /// Time until the suspicion of `name` would expire; used in tests.
    #[cfg(test)]
    pub fn remaining_suspicion(
        &self,
        name: &NodeName,
        now: Instant,
    ) -> Option<std::time::Duration> {
        let state = self.registry.get(name)?;
        state
            .suspicion
            .as_ref()
            .map(|s| s.deadline().saturating_duration_since(now))
    }
}
