//! Comfort noise analysis and synthesis.

use std::sync::Mutex;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ComfortNoise;
use crate::audio::Pcm;

/// EMA rate for the analyzed background level.
const LEVEL_SMOOTH: f32 = 0.3;
/// Per-sample rate at which generated noise moves toward the analyzed
/// level, avoiding audible steps between silence gaps.
const TRANSITION: f32 = 0.005;
/// Uniform white noise with amplitude a has RMS a/sqrt(3).
const UNIFORM_RMS_FACTOR: f32 = 1.732;

struct CngState {
    /// Analyzed background level (normalized RMS).
    target_level: f32,
    /// Level currently being synthesized.
    current_level: f32,
    rng: StdRng,
}

/// White-noise comfort noise generator.
///
/// `analyze` keeps a smoothed estimate of the background level from
/// silence-classified frames; `generate` synthesizes white noise at that
/// level so suppressed silence does not play back as dead air.
pub struct ComfortNoiseGenerator<const SAMPLE_RATE: u32> {
    frame_size: usize,
    state: Mutex<CngState>,
}

impl<const SAMPLE_RATE: u32> ComfortNoiseGenerator<SAMPLE_RATE> {
    pub fn new(frame_size: usize) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("comfort noise frame size must be non-zero");
        }

        Ok(Self {
            frame_size,
            state: Mutex::new(CngState {
                target_level: 0.0,
                current_level: 0.0,
                rng: StdRng::from_entropy(),
            }),
        })
    }
}

impl<const SAMPLE_RATE: u32> ComfortNoise<SAMPLE_RATE> for ComfortNoiseGenerator<SAMPLE_RATE> {
    fn analyze(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<()> {
        if frame.len() != self.frame_size {
            anyhow::bail!(
                "comfort noise analysis expects {} samples, got {}",
                self.frame_size,
                frame.len()
            );
        }

        let sum_sq: i64 = frame.data().iter().map(|&s| s as i64 * s as i64).sum();
        let rms = ((sum_sq as f32 / frame.len() as f32).sqrt()) / 32768.0;

        let mut state = self.state.lock().unwrap();
        state.target_level += (rms - state.target_level) * LEVEL_SMOOTH;
        Ok(())
    }

    fn generate(&self, len: usize) -> Pcm<SAMPLE_RATE> {
        let mut state = self.state.lock().unwrap();

        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            let target = state.target_level;
            state.current_level += (target - state.current_level) * TRANSITION;
            let amplitude = state.current_level * UNIFORM_RMS_FACTOR;
            let value: f32 = state.rng.gen_range(-1.0..1.0) * amplitude;
            out.push((value * 32767.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }

        Pcm::new(out)
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.target_level = 0.0;
        state.current_level = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_frame(amplitude: i16, seed: &mut u32) -> Pcm<8000> {
        Pcm::new(
            (0..160)
                .map(|_| {
                    *seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                    ((*seed >> 16) as i32 % (amplitude as i32 * 2) - amplitude as i32) as i16
                })
                .collect(),
        )
    }

    fn rms(samples: &[i16]) -> f32 {
        let sum_sq: i64 = samples.iter().map(|&s| s as i64 * s as i64).sum();
        (sum_sq as f32 / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_generate_matches_analyzed_level() {
        let cng = ComfortNoiseGenerator::<8000>::new(160).unwrap();
        let mut seed = 11;

        let mut analyzed_rms = 0.0;
        for _ in 0..30 {
            let frame = noise_frame(600, &mut seed);
            analyzed_rms = rms(frame.data());
            cng.analyze(&frame).unwrap();
        }

        // Let the transition ramp settle, then compare levels
        cng.generate(8000);
        let generated = cng.generate(1600);
        let generated_rms = rms(generated.data());

        assert!(
            generated_rms > analyzed_rms * 0.5 && generated_rms < analyzed_rms * 2.0,
            "generated rms {} should track analyzed rms {}",
            generated_rms,
            analyzed_rms
        );
    }

    #[test]
    fn test_generate_before_analyze_is_silence() {
        let cng = ComfortNoiseGenerator::<8000>::new(160).unwrap();
        let out = cng.generate(160);
        assert_eq!(out.len(), 160);
        assert!(out.data().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_reset_returns_to_silence() {
        let cng = ComfortNoiseGenerator::<8000>::new(160).unwrap();
        let mut seed = 5;
        for _ in 0..10 {
            cng.analyze(&noise_frame(1000, &mut seed)).unwrap();
        }
        cng.reset();
        let out = cng.generate(160);
        assert!(out.data().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_analyze_rejects_wrong_length() {
        let cng = ComfortNoiseGenerator::<8000>::new(160).unwrap();
        assert!(cng.analyze(&Pcm::<8000>::silence(100)).is_err());
    }

    #[test]
    fn test_generate_exact_length() {
        let cng = ComfortNoiseGenerator::<8000>::new(160).unwrap();
        assert_eq!(cng.generate(0).len(), 0);
        assert_eq!(cng.generate(317).len(), 317);
    }
}
