//! Per-frame DSP stages and their capability traits.
//!
//! The pipeline talks to every signal-processing stage through a narrow
//! trait, one per role, so alternate implementations can be substituted
//! without touching the orchestrator. Each stage owns its adaptive state
//! behind interior mutability and exposes `&self` methods; a call that
//! rejects its input (wrong frame length) must leave that state
//! untouched.
//!
//! Default implementations:
//! - [`NlmsEchoCanceller`] - adaptive-filter echo removal
//! - [`NoiseSuppressor`] - noise-floor tracking suppression
//! - [`EnergyVad`] - energy-based voice activity detection
//! - [`AdaptiveGain`] - automatic gain control with limiter
//! - [`ComfortNoiseGenerator`] - background-noise analysis and synthesis
//! - [`LevelMeter`] - peak/RMS metering with meter ballistics

pub mod aec;
pub mod agc;
pub mod comfort_noise;
pub mod denoiser;
pub mod level_meter;
pub mod vad;

use anyhow::Result;

use crate::audio::Pcm;

/// Acoustic echo cancellation: subtracts the playback reference from the
/// captured signal.
pub trait EchoCancel<const SAMPLE_RATE: u32>: Send + Sync {
    /// Process one captured frame against the frame that was played back
    /// at the same time. Output length equals input length.
    fn process(
        &self,
        captured: &Pcm<SAMPLE_RATE>,
        reference: &Pcm<SAMPLE_RATE>,
    ) -> Result<Pcm<SAMPLE_RATE>>;

    fn reset(&self);
}

/// Background noise suppression.
pub trait Denoise<const SAMPLE_RATE: u32>: Send + Sync {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<Pcm<SAMPLE_RATE>>;

    fn reset(&self);
}

/// Voice activity detection.
pub trait DetectVoice<const SAMPLE_RATE: u32>: Send + Sync {
    fn is_speech(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<bool>;

    /// Speech probability in `[0, 1]` for the most recent call.
    fn probability(&self) -> f32;

    fn reset(&self);
}

/// Automatic gain control.
pub trait ControlGain<const SAMPLE_RATE: u32>: Send + Sync {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<Pcm<SAMPLE_RATE>>;

    /// Current linear gain.
    fn gain(&self) -> f32;

    fn reset(&self);
}

/// Comfort noise: analyzes background noise during silence so matching
/// noise can be synthesized at the receiver.
pub trait ComfortNoise<const SAMPLE_RATE: u32>: Send + Sync {
    /// Update the internal noise model from a silence-classified frame.
    fn analyze(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<()>;

    /// Synthesize `len` samples of noise matching the analyzed model.
    fn generate(&self, len: usize) -> Pcm<SAMPLE_RATE>;

    fn reset(&self);
}

/// Audio level metering.
pub trait MeterLevel<const SAMPLE_RATE: u32>: Send + Sync {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<()>;

    /// Smoothed level in dBFS (same as the RMS reading).
    fn level_db(&self) -> f32;

    fn peak_db(&self) -> f32;

    fn rms_db(&self) -> f32;

    fn is_silence(&self) -> bool;

    fn is_clipping(&self) -> bool;

    fn reset(&self);
}

pub use aec::NlmsEchoCanceller;
pub use agc::AdaptiveGain;
pub use comfort_noise::ComfortNoiseGenerator;
pub use denoiser::NoiseSuppressor;
pub use level_meter::LevelMeter;
pub use vad::EnergyVad;

/// Floor used when converting degenerate energies to dB.
pub(crate) const DB_FLOOR: f32 = -96.0;

/// RMS of a frame in dBFS relative to 16-bit full scale.
pub(crate) fn rms_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return DB_FLOOR;
    }
    let sum_sq: i64 = samples.iter().map(|&s| s as i64 * s as i64).sum();
    let mean = sum_sq as f32 / samples.len() as f32;
    if mean <= 0.0 {
        return DB_FLOOR;
    }
    let db = 10.0 * mean.log10() - 20.0 * 32768.0f32.log10();
    db.max(DB_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_dbfs_silence_floor() {
        assert_eq!(rms_dbfs(&[0; 160]), DB_FLOOR);
        assert_eq!(rms_dbfs(&[]), DB_FLOOR);
    }

    #[test]
    fn test_rms_dbfs_full_scale() {
        let full = vec![i16::MAX; 160];
        let db = rms_dbfs(&full);
        assert!(db.abs() < 0.01, "full scale should be ~0 dBFS, got {}", db);
    }

    #[test]
    fn test_rms_dbfs_half_scale() {
        let half = vec![i16::MAX / 2; 160];
        let db = rms_dbfs(&half);
        assert!((db + 6.02).abs() < 0.1, "half scale should be ~-6 dBFS, got {}", db);
    }
}
