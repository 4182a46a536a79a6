//! Core audio data types.
//!
//! - [`AudioSample`] - Trait for audio sample types (i16, f32)
//! - [`frame::AudioBuffer`] - A mono buffer of audio samples (raw PCM data)
//! - [`frame::AudioFrame`] - An [`frame::AudioBuffer`] with transport timing metadata
//! - [`frame::Pcm`] - The pipeline's working alias, 16-bit mono PCM

pub mod frame;
pub mod sample;

pub use frame::{AudioBuffer, AudioFrame, Pcm};
pub use sample::AudioSample;
