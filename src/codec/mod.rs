//! Narrowband codec support.
//!
//! The pipeline encodes speech frames with G.711 (one byte per sample).
//! [`AudioCodec`] is the seam: any encoder/decoder pair that maps a
//! fixed-size PCM frame to an opaque payload and back can be swapped in.

pub mod g711;

use anyhow::Result;

use crate::audio::Pcm;

/// Encoder/decoder pair used by the pipeline.
///
/// Implementations own whatever codec state they need; both directions
/// must accept exactly one frame per call.
pub trait AudioCodec<const SAMPLE_RATE: u32>: Send + Sync {
    /// Encode one PCM frame into an opaque payload.
    fn encode(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<Vec<u8>>;

    /// Decode one payload back into a PCM frame.
    fn decode(&self, payload: &[u8]) -> Result<Pcm<SAMPLE_RATE>>;

    fn reset(&self);
}

pub use g711::{G711Codec, G711Law};
