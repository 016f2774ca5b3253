use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::suspicion::Suspicion;

/// Oldest protocol version this build can speak.
pub const PROTOCOL_VERSION_MIN: u8 = 1;

/// Newest protocol version this build can speak.
pub const PROTOCOL_VERSION_MAX: u8 = 2;

/// Upper bound on the opaque metadata a node may advertise.
pub const META_MAX_SIZE: usize = 512;

/// Unique identity of a cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeName(pub String);

impl NodeName {
    /// Generates a random name, used when the configuration leaves it unset.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Protocol version triple carried by every node and every packet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub min: u8,
    pub max: u8,
    pub current: u8,
}

impl ProtocolVersion {
    /// True when the two ranges share at least one version.
    pub fn overlaps(&self, other: &ProtocolVersion) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

/// Lifecycle state of a member.
///
/// The derived ordering is the conflict-resolution precedence at equal
/// incarnation: `Left > Dead > Suspect > Alive`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl State {
    /// Dead and Left members are excluded from `members()` and from probing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Dead | State::Left)
    }
}

/// Represents a single member in the cluster.
///
/// `gossip_addr` receives the UDP probe/gossip traffic, `stream_addr` accepts
/// the TCP push/pull exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub name: NodeName,
    pub gossip_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    pub meta: Vec<u8>,
    pub version: ProtocolVersion,
}

/// A member as seen by the local registry.
///
/// The `incarnation` field is a logical clock owned by the subject node and
/// used to order updates and refute stale claims about it.
#[derive(Debug)]
pub struct NodeState {
    pub node: Node,
    pub state: State,
    pub incarnation: u64,
    pub state_change: Instant,
    pub(crate) suspicion: Option<Suspicion>,
}

impl NodeState {
    pub fn new(node: Node, state: State, incarnation: u64) -> Self {
        Self {
            node,
            state,
            incarnation,
            state_change: Instant::now(),
            suspicion: None,
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.node.name
    }

    /// Number of distinct reporters that corroborated the current suspicion.
    pub fn confirmations(&self) -> usize {
        self.suspicion
            .as_ref()
            .map(|s| s.confirmations())
            .unwrap_or(0)
    }
}

/// Membership changes observed by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(Node),
    NodeUpdated(Node),
    NodeSuspected(NodeName),
    NodeFailed(Node),
    NodeLeft(Node),
}
