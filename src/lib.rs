//! Real-time voice-communication pipeline core.
//!
//! voicelink takes raw microphone frames plus a playback reference,
//! removes echo and noise, detects speech, normalizes level, encodes to
//! G.711, and on the receiving side absorbs network jitter to
//! reconstruct a smooth playout stream. Silence is never transmitted:
//! silent frames feed a comfort-noise model instead, and the receiver
//! synthesizes matching background noise into the gaps.
//!
//! # Layout
//!
//! - [`audio`] - sample and frame types
//! - [`dsp`] - per-frame stages (AEC, denoise, VAD, AGC, comfort noise,
//!   level meter) behind substitutable capability traits
//! - [`codec`] - G.711 A-law/mu-law
//! - [`net`] - wire packet, adaptive jitter buffer, transport seam
//! - [`pipeline`] - the orchestrator tying it all together
//!
//! # Example
//!
//! ```
//! use voicelink::pipeline::{PipelineConfig, VoicePipeline};
//! use voicelink::audio::Pcm;
//!
//! let alice: VoicePipeline<8000> = VoicePipeline::new(PipelineConfig::default()).unwrap();
//! let bob: VoicePipeline<8000> = VoicePipeline::new(PipelineConfig::default()).unwrap();
//!
//! let captured = Pcm::new(vec![0i16; alice.frame_size()]);
//! let reference = Pcm::silence(alice.frame_size());
//!
//! // silence: nothing to send
//! if let Some(packet) = alice.process_capture(&captured, &reference).unwrap() {
//!     bob.receive_packet(&packet).unwrap();
//! }
//! let playback = bob.get_playback_audio(bob.frame_size());
//! assert_eq!(playback.len(), bob.frame_size());
//! ```

pub mod audio;
pub mod codec;
pub mod dsp;
pub mod net;
pub mod pipeline;

pub use audio::{AudioBuffer, AudioFrame, AudioSample, Pcm};
pub use codec::{AudioCodec, G711Codec, G711Law};
pub use net::{EncodedPacket, JitterBuffer, JitterConfig, JitterStats, LinkProfile, SimulatedLink};
pub use pipeline::{PipelineConfig, PipelineState, PipelineStats, VoicePipeline};
