//! Broadcast Queue
//!
//! Holds encoded gossip items until their retransmit budget is spent.
//!
//! ## Rules
//! - **Invalidation**: an item queued under an existing key replaces the older
//!   one, so only the newest fact about a node is relayed.
//! - **Priority**: packets are filled with the items that have the largest
//!   remaining budget first. On ties, membership facts go newest first and
//!   ahead of application payloads.
//! - **Ordering**: application payloads leave strictly oldest first, across
//!   packets as well as within one. A payload that does not fit holds back
//!   every payload queued after it. Items picked for one packet are emitted
//!   in enqueue order.

use tokio::sync::oneshot;

use super::error::{MembershipError, Result};
use super::types::NodeName;

/// Invalidation key of a queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastKey {
    /// Membership fact about a node; newer facts replace older ones.
    Node(NodeName),
    /// Application payload; never replaced.
    Unique(u64),
}

#[derive(Debug)]
struct QueuedBroadcast {
    key: BroadcastKey,
    payload: Vec<u8>,
    transmits_left: u32,
    seq: u64,
    finished: Option<oneshot::Sender<()>>,
}

impl QueuedBroadcast {
    fn is_unique(&self) -> bool {
        matches!(self.key, BroadcastKey::Unique(_))
    }

    fn finish(mut self) {
        if let Some(tx) = self.finished.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
pub struct BroadcastQueue {
    items: Vec<QueuedBroadcast>,
    next_seq: u64,
    max_payload: usize,
}

impl BroadcastQueue {
    /// `max_payload` is the largest item that fits an otherwise empty packet.
    pub fn new(max_payload: usize) -> Self {
        Self {
            items: Vec::new(),
            next_seq: 0,
            max_payload,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queues a membership fact about `node`, replacing any older fact.
    pub fn queue_fact(&mut self, node: NodeName, payload: Vec<u8>, transmits: u32) -> Result<()> {
        self.push(BroadcastKey::Node(node), payload, transmits, None)
    }

    /// Like `queue_fact`, but `finished` fires once the item is retired.
    pub fn queue_fact_notify(
        &mut self,
        node: NodeName,
        payload: Vec<u8>,
        transmits: u32,
        finished: oneshot::Sender<()>,
    ) -> Result<()> {
        self.push(BroadcastKey::Node(node), payload, transmits, Some(finished))
    }

    /// Queues an application payload. It is never deduplicated.
    pub fn queue_unique(&mut self, payload: Vec<u8>, transmits: u32) -> Result<()> {
        let key = BroadcastKey::Unique(self.next_seq);
        self.push(key, payload, transmits, None)
    }

    fn push(
        &mut self,
        key: BroadcastKey,
        payload: Vec<u8>,
        transmits: u32,
        finished: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(MembershipError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }

        if matches!(key, BroadcastKey::Node(_)) {
            if let Some(pos) = self.items.iter().position(|item| item.key == key) {
                self.items.remove(pos).finish();
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.items.push(QueuedBroadcast {
            key,
            payload,
            transmits_left: transmits.max(1),
            seq,
            finished,
        });

        Ok(())
    }

    /// Drains items for one packet.
    ///
    /// Each item costs its length plus `overhead`; selection stops adding items
    /// once nothing else fits in `limit` bytes. Selected items lose one unit of
    /// budget and are retired when it reaches zero.
    pub fn get_broadcasts(&mut self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.items[a], &self.items[b]);
            b.transmits_left
                .cmp(&a.transmits_left)
                .then(a.is_unique().cmp(&b.is_unique()))
                .then_with(|| {
                    if a.is_unique() {
                        a.seq.cmp(&b.seq)
                    } else {
                        b.seq.cmp(&a.seq)
                    }
                })
        });

        let mut remaining = limit;
        let mut picked = Vec::new();
        let mut unique_blocked = false;
        for idx in order {
            let unique = self.items[idx].is_unique();
            if unique && unique_blocked {
                continue;
            }

            let cost = self.items[idx].payload.len() + overhead;
            if cost > remaining {
                unique_blocked |= unique;
                continue;
            }
            remaining -= cost;
            picked.push(idx);
        }

        // Emit in enqueue order.
        picked.sort_by_key(|&idx| self.items[idx].seq);

        let mut out = Vec::with_capacity(picked.len());
        for &idx in &picked {
            let item = &mut self.items[idx];
            item.transmits_left -= 1;
            out.push(item.payload.clone());
        }

        // Retire exhausted items. Iterate from the back so indices stay valid.
        picked.sort_unstable_by(|a, b| b.cmp(a));
        for idx in picked {
            if self.items[idx].transmits_left == 0 {
                self.items.remove(idx).finish();
            }
        }

        out
    }

    /// Drops every pending item, firing their completion notifiers.
    pub fn reset(&mut self) {
        for item in self.items.drain(..) {
            item.finish();
        }
    }
}
