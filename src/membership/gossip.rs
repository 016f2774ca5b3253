//! Gossip Disseminator
//!
//! Every `gossip_interval`, sends one freshly filled packet to each of up to
//! `gossip_nodes` random peers, independent of which node is being probed.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::protocol::PACKET_OVERHEAD;
use super::service::MembershipService;

impl MembershipService {
    pub(crate) async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            self.gossip().await;
        }

        debug!("Gossip loop stopped");
    }

    pub(crate) async fn gossip(&self) {
        let targets = self
            .state
            .lock()
            .gossip_targets(self.config.gossip_nodes, Instant::now());

        if targets.is_empty() {
            return;
        }

        let limit = self.config.packet_size - PACKET_OVERHEAD;
        for addr in targets {
            let parts = self.gossip_parts(limit);
            if parts.is_empty() {
                return;
            }

            trace!("Gossiping {} message(s) to {}", parts.len(), addr);
            if let Err(e) = self.send_packet(addr, parts).await {
                warn!("Failed to gossip to {}: {}", addr, e);
            }
        }
    }
}
