//! Pipeline configuration.

use anyhow::Result;

use crate::codec::G711Law;
use crate::dsp::agc::AgcConfig;
use crate::net::JitterConfig;

/// Everything configurable about a call pipeline. Validation fails fast
/// at construction; a pipeline never starts with a nonsense config.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub frame_duration_ms: u32,
    pub law: G711Law,
    /// Echo tail length the AEC can model, in filter taps.
    pub aec_filter_taps: usize,
    /// Maximum denoiser attenuation, negative dB.
    pub denoise_suppress_db: f32,
    pub vad_hangover_ms: u32,
    pub agc: AgcConfig,
    /// Jitter delay window; `frame_size` is derived from
    /// `frame_duration_ms` and overwritten at construction.
    pub jitter: JitterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: 20,
            law: G711Law::ALaw,
            aec_filter_taps: 256,
            denoise_suppress_db: -25.0,
            vad_hangover_ms: 200,
            agc: AgcConfig::default(),
            jitter: JitterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Samples per frame at the given rate, or an error if the duration
    /// does not divide into whole samples.
    pub fn frame_size(&self, sample_rate: u32) -> Result<usize> {
        if self.frame_duration_ms == 0 {
            anyhow::bail!("frame duration must be non-zero");
        }
        let numerator = sample_rate as u64 * self.frame_duration_ms as u64;
        if numerator % 1000 != 0 {
            anyhow::bail!(
                "{}ms frames are not a whole number of samples at {}Hz",
                self.frame_duration_ms,
                sample_rate
            );
        }
        Ok((numerator / 1000) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_narrowband() {
        let config = PipelineConfig::default();
        assert_eq!(config.frame_size(8000).unwrap(), 160);
        assert_eq!(config.frame_size(16000).unwrap(), 320);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = PipelineConfig {
            frame_duration_ms: 0,
            ..PipelineConfig::default()
        };
        assert!(config.frame_size(8000).is_err());
    }

    #[test]
    fn test_fractional_frame_rejected() {
        let config = PipelineConfig {
            frame_duration_ms: 3,
            ..PipelineConfig::default()
        };
        assert!(config.frame_size(22050).is_err());
    }
}
