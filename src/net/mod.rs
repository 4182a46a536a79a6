//! Network-facing types: the wire packet, the jitter buffer, and the
//! transport seam.

pub mod jitter;
pub mod link;
pub mod packet;

pub use jitter::{JitterBuffer, JitterConfig, JitterStats};
pub use link::{LinkProfile, PacketSink, SimulatedLink};
pub use packet::EncodedPacket;
