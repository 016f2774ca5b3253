//! Failure Detector
//!
//! One probe per `probe_interval`, walking the shuffled probe ring:
//!
//! 1. `Ping` the target directly and wait for the first half of
//!    `probe_timeout`.
//! 2. Without an ack, ask up to `indirect_checks` random Alive peers to probe
//!    the target on our behalf. Their relayed acks arrive under the same
//!    sequence number, so a late direct ack still counts.
//! 3. Without any ack by the overall deadline, the target becomes Suspect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::protocol::Message;
use super::service::MembershipService;
use super::types::{Node, NodeName};

impl MembershipService {
    pub(crate) async fn probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let target = self.state.lock().next_probe_target(Instant::now());
            if let Some((node, incarnation)) = target {
                self.probe_node(node, incarnation).await;
            }
        }

        debug!("Probe loop stopped");
    }

    /// Probes `target` and suspects it at `incarnation` if nobody can reach it.
    pub(crate) async fn probe_node(self: &Arc<Self>, target: Node, incarnation: u64) {
        let probe_timeout = self.config.probe_timeout;
        let deadline = tokio::time::Instant::now() + probe_timeout;

        let seq = self.next_seq();
        let mut acked = self.register_ack(seq);

        let ping = Message::Ping {
            seq,
            target: target.name.clone(),
        };
        if let Err(e) = self.send_with_piggyback(target.gossip_addr, ping).await {
            warn!("Failed to ping {} at {}: {}", target.name, target.gossip_addr, e);
        }

        let direct = tokio::time::timeout(probe_timeout / 2, &mut acked).await;
        let mut reached = matches!(direct, Ok(Ok(())));

        if !reached {
            let helpers = self
                .state
                .lock()
                .indirect_helpers(&target.name, self.config.indirect_checks);

            debug!(
                "No direct ack from {}, asking {} helper(s)",
                target.name,
                helpers.len()
            );

            for helper in helpers {
                let request = Message::IndirectPing {
                    seq,
                    target: target.gossip_addr,
                    target_name: target.name.clone(),
                };
                if let Err(e) = self.send_with_piggyback(helper, request).await {
                    warn!("Failed to send indirect ping via {}: {}", helper, e);
                }
            }

            let indirect = tokio::time::timeout_at(deadline, &mut acked).await;
            reached = matches!(indirect, Ok(Ok(())));
        }

        self.clear_ack(seq);

        if reached {
            trace!("Probe of {} succeeded", target.name);
            return;
        }

        info!(
            "Probe of {} failed within {:?}, suspecting",
            target.name, probe_timeout
        );

        let local = self.local_node().name.clone();
        let effects =
            self.state
                .lock()
                .suspect_node(incarnation, &target.name, &local, Instant::now());
        self.apply_effects(effects);
    }

    /// Probes `target` for a peer and relays the ack under the peer's `seq`.
    pub(crate) async fn relay_probe(
        &self,
        seq: u32,
        target: SocketAddr,
        target_name: NodeName,
        requester: SocketAddr,
    ) {
        let relay_seq = self.next_seq();
        let mut acked = self.register_ack(relay_seq);

        let ping = Message::Ping {
            seq: relay_seq,
            target: target_name.clone(),
        };
        if let Err(e) = self.send_with_piggyback(target, ping).await {
            warn!("Failed to relay ping to {}: {}", target_name, e);
            self.clear_ack(relay_seq);
            return;
        }

        let result = tokio::time::timeout(self.config.probe_timeout, &mut acked).await;
        self.clear_ack(relay_seq);

        if !matches!(result, Ok(Ok(()))) {
            debug!("Relayed probe of {} for {} timed out", target_name, requester);
            return;
        }

        if let Err(e) = self.send_with_piggyback(requester, Message::Ack { seq }).await {
            warn!("Failed to relay ack for {} to {}: {}", target_name, requester, e);
        }
    }
}
