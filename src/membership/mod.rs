//! Membership & Failure Detection Module
//!
//! Implements a SWIM-style gossip membership protocol. Every node keeps its
//! own view of the cluster and converges on the others' through probing,
//! gossip and periodic full-state exchange. There is no coordinator.
//!
//! ## Core Mechanisms
//! - **Failure Detection**: Direct and indirect UDP probes. An unreachable node
//!   becomes Suspect and is declared Dead when its suspicion timer expires.
//!   The timer shrinks as independent peers corroborate it.
//! - **Incarnation Numbers**: Per-node logical clock. A node refutes claims
//!   about its own death by gossiping Alive with a higher incarnation.
//! - **Dissemination**: Every state change is queued with a retransmit budget
//!   and piggybacked on probe traffic or sent to a random fan-out.
//! - **Anti-Entropy**: Periodic TCP push/pull of the whole registry, replayed
//!   through the same transitions as gossip. Join is a push/pull with a seed.

pub mod broadcast;
pub mod config;
pub mod delegate;
pub mod error;
mod gossip;
mod prober;
pub mod protocol;
mod push_pull;
pub mod registry;
pub mod service;
pub(crate) mod state;
pub mod suspicion;
pub mod types;

pub use config::Config;
pub use delegate::{Delegate, NoopDelegate};
pub use error::{JoinError, MembershipError, SeedFailure, ShutdownStatus};
pub use service::MembershipService;
pub use types::{MembershipEvent, Node, NodeName, ProtocolVersion, State};

#[cfg(test)]
mod tests;
