use anyhow::{Context, Result};
use rkyv::{Archive, Deserialize, Serialize};

/// One encoded audio packet as it crosses the transport.
///
/// G.711 payloads are one byte per sample. The timestamp is in
/// sample-clock units and advances by one frame per *sent* packet; it
/// keeps counting through suppressed silence, so gaps are normal. The
/// sequence number increments per sent packet and wraps at 16 bits.
/// Transports must preserve all three fields but may reorder, drop, or
/// duplicate packets.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq))]
pub struct EncodedPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

impl EncodedPacket {
    pub fn new(sequence: u16, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp,
            payload,
        }
    }

    /// Serialize the packet for the wire using rkyv.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .context("Packet serialization error")
    }

    /// Deserialize a packet from wire bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<EncodedPacket, rkyv::rancor::Error>(bytes)
            .context("Packet deserialization error")
    }
}
