//! Suspicion Timers
//!
//! A suspected node is declared dead when its suspicion timer runs out. The
//! timer starts long and shrinks as independent peers corroborate the
//! suspicion, so a node that many members fail to reach is confirmed dead
//! faster than one suspected by a single, possibly partitioned, peer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::types::NodeName;

/// Scales protocol timers with the logarithm of the cluster size.
pub fn node_scale(cluster_size: usize) -> f64 {
    (cluster_size.max(1) as f64).log10().max(1.0)
}

/// Number of times a membership fact is retransmitted before it is dropped.
pub fn retransmit_limit(retransmit_mult: u32, cluster_size: usize) -> u32 {
    let scale = ((cluster_size + 1) as f64).log10().ceil() as u32;
    retransmit_mult * scale.max(1)
}

/// Suspicion timeout bounds for one suspicion, fixed when it starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspicionTimeout {
    pub floor: Duration,
    pub ceiling: Duration,
    /// Corroborations needed to shrink the timeout all the way to the floor.
    pub expected: u32,
}

impl SuspicionTimeout {
    pub fn new(
        suspicion_mult: u32,
        suspicion_max_timeout_mult: u32,
        probe_interval: Duration,
        indirect_checks: usize,
        cluster_size: usize,
    ) -> Self {
        let floor = probe_interval.mul_f64(suspicion_mult as f64 * node_scale(cluster_size));
        let ceiling = floor * suspicion_max_timeout_mult.max(1);
        let expected = indirect_checks.min(cluster_size.saturating_sub(2)) as u32;

        Self {
            floor,
            ceiling,
            expected,
        }
    }

    /// Timeout after `confirmations` independent corroborations.
    pub fn after(&self, confirmations: u32) -> Duration {
        if self.expected == 0 {
            return self.floor;
        }

        let k = confirmations.min(self.expected) as f64;
        let fraction = (k + 1.0).ln() / (self.expected as f64 + 1.0).ln();
        let span = self.ceiling.saturating_sub(self.floor).as_secs_f64();
        let raw = self.ceiling.as_secs_f64() - fraction * span;

        Duration::from_secs_f64(raw).clamp(self.floor, self.ceiling)
    }
}

/// Live suspicion attached to a `NodeState`.
#[derive(Debug)]
pub struct Suspicion {
    started: Instant,
    timeout: SuspicionTimeout,
    reporters: HashSet<NodeName>,
    wake: Arc<Notify>,
}

impl Suspicion {
    pub fn new(from: NodeName, timeout: SuspicionTimeout, started: Instant) -> Self {
        let mut reporters = HashSet::new();
        reporters.insert(from);

        Self {
            started,
            timeout,
            reporters,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Records a report. Returns `false` when `from` was already counted.
    pub fn confirm(&mut self, from: NodeName) -> bool {
        if !self.reporters.insert(from) {
            return false;
        }

        // The deadline moved closer; let the timer task re-read it.
        self.wake.notify_one();
        true
    }

    /// Corroborations beyond the initial report.
    pub fn confirmations(&self) -> usize {
        self.reporters.len().saturating_sub(1)
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout.after(self.confirmations() as u32)
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}
