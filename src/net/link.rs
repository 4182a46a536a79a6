//! Transport abstraction.
//!
//! The pipeline needs exactly one thing from a transport: somewhere to
//! hand an [`EncodedPacket`]. Real transports (UDP, RTP stacks) live
//! outside this crate; [`SimulatedLink`] stands in for them in tests and
//! call simulations, with configurable packet impairments.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::packet::EncodedPacket;

/// Receiver side of a transport: accepts outgoing packets.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: EncodedPacket);
}

/// Impairment probabilities, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkProfile {
    pub loss: f64,
    pub duplicate: f64,
    /// Chance that a packet is swapped with the one queued before it.
    pub reorder: f64,
}

struct LinkState {
    queue: VecDeque<EncodedPacket>,
    rng: StdRng,
    dropped: u64,
}

/// In-memory packet path with loss, duplication, and reordering.
///
/// Deterministic under a fixed seed, which is what the call-simulation
/// tests rely on.
pub struct SimulatedLink {
    profile: LinkProfile,
    state: Mutex<LinkState>,
}

impl SimulatedLink {
    pub fn new(profile: LinkProfile) -> Self {
        Self::with_seed(profile, rand::thread_rng().r#gen())
    }

    pub fn with_seed(profile: LinkProfile, seed: u64) -> Self {
        Self {
            profile,
            state: Mutex::new(LinkState {
                queue: VecDeque::new(),
                rng: StdRng::seed_from_u64(seed),
                dropped: 0,
            }),
        }
    }

    /// Take every packet currently in flight, in delivery order.
    pub fn drain(&self) -> Vec<EncodedPacket> {
        let mut state = self.state.lock().unwrap();
        state.queue.drain(..).collect()
    }

    /// Packets dropped by the simulated loss so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }
}

impl PacketSink for SimulatedLink {
    fn deliver(&self, packet: EncodedPacket) {
        let mut state = self.state.lock().unwrap();

        if state.rng.r#gen::<f64>() < self.profile.loss {
            state.dropped += 1;
            debug!(sequence = packet.sequence, "link dropped packet");
            return;
        }

        let duplicate = state.rng.r#gen::<f64>() < self.profile.duplicate;
        let reorder = state.rng.r#gen::<f64>() < self.profile.reorder;

        state.queue.push_back(packet.clone());
        if duplicate {
            state.queue.push_back(packet);
        }
        if reorder && state.queue.len() >= 2 {
            let last = state.queue.len() - 1;
            state.queue.swap(last, last - 1);
        }
    }
}
