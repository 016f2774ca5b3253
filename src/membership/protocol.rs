//! Wire Protocol
//!
//! Every UDP datagram and every TCP frame carries one bincode-encoded `Packet`:
//! the sender's protocol version triple plus a list of individually encoded
//! `Message` parts. A probe packet carries its Ping/Ack as the first part and
//! piggybacked gossip after it; a gossip packet carries only gossip.
//!
//! TCP frames are prefixed with their length as a big-endian `u32`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{MembershipError, Result};
use super::types::{Node, NodeName, ProtocolVersion, State};

/// Bytes a `Packet` adds around its parts: the version triple and the part count.
pub const PACKET_OVERHEAD: usize = 3 + 8;

/// Bytes each part adds on top of its payload: the length prefix.
pub const PART_OVERHEAD: usize = 8;

/// Bytes a `Message::User` adds around the application payload.
pub const USER_MESSAGE_OVERHEAD: usize = 4 + 8;

/// Largest TCP frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Direct liveness probe. `target` lets a receiver reject probes meant for
    /// a previous owner of its address.
    Ping { seq: u32, target: NodeName },

    /// Asks a helper to probe `target` and relay the ack under `seq`.
    IndirectPing {
        seq: u32,
        target: SocketAddr,
        target_name: NodeName,
    },

    Ack { seq: u32 },

    Suspect {
        incarnation: u64,
        node: NodeName,
        from: NodeName,
    },

    Alive { incarnation: u64, node: Node },

    /// `from == node` marks a voluntary departure.
    Dead {
        incarnation: u64,
        node: NodeName,
        from: NodeName,
    },

    PushPull {
        join: bool,
        from: NodeName,
        nodes: Vec<PushNodeState>,
        user_state: Vec<u8>,
    },

    User { payload: Vec<u8> },
}

/// One registry entry as exchanged during push/pull.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushNodeState {
    pub node: Node,
    pub incarnation: u64,
    pub state: State,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub version: ProtocolVersion,
    pub parts: Vec<Vec<u8>>,
}

impl Packet {
    pub fn new(version: ProtocolVersion, parts: Vec<Vec<u8>>) -> Self {
        Self { version, parts }
    }

    /// Encoded size, computed without serializing.
    pub fn encoded_len(&self) -> usize {
        PACKET_OVERHEAD
            + self
                .parts
                .iter()
                .map(|part| part.len() + PART_OVERHEAD)
                .sum::<usize>()
    }
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode_message(buf: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(buf)?)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_packet(buf: &[u8]) -> Result<Packet> {
    Ok(bincode::deserialize(buf)?)
}

pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_packet(packet)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(MembershipError::MessageTooLarge {
            size: encoded.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    writer.write_u32(encoded.len() as u32).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MembershipError::MalformedMessage(format!(
            "frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    decode_packet(&buf)
}
