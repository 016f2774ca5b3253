//! Application Delegate
//!
//! Hooks through which the embedding application attaches its own data to the
//! membership protocol. Every method has a no-op default, so an implementor
//! only overrides what it needs.
//!
//! The service never calls a delegate while holding its internal lock, so an
//! implementation may call back into the service.

/// Capabilities the membership service invokes on the application.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata advertised for the local node. Must not exceed `limit` bytes.
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// Delivers one application payload gossiped by a peer.
    fn notify_msg(&self, _msg: &[u8]) {}

    /// Payloads to gossip. Each must fit `limit` once `overhead` is added.
    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Opaque state attached to every outgoing push/pull.
    fn local_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Receives the peer's `local_state` after a push/pull.
    fn merge_remote_state(&self, _buf: &[u8]) {}
}

/// Delegate that ignores every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}
