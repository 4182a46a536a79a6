//! Background noise suppression.

use std::sync::Mutex;

use anyhow::Result;

use super::Denoise;
use crate::audio::Pcm;

/// How fast the floor estimate falls onto a quieter frame vs. how slowly
/// it creeps up when the signal stays loud.
const FLOOR_FALL: f32 = 0.3;
const FLOOR_RISE: f32 = 0.005;
/// Per-frame smoothing applied to the suppression gain.
const GAIN_SMOOTH: f32 = 0.6;
const RMS_EPSILON: f32 = 1e-6;

struct SuppressorState {
    /// Estimated noise floor as normalized RMS.
    noise_floor: f32,
    /// Smoothed suppression gain actually applied.
    gain: f32,
    primed: bool,
}

/// Noise suppressor driven by a tracked noise floor.
///
/// The floor estimate follows frame RMS minima (drops quickly toward
/// quiet frames, rises slowly through loud ones), and each frame is
/// scaled by a Wiener-like gain: frames near the floor are pushed down
/// to the configured attenuation, frames well above it pass through.
pub struct NoiseSuppressor<const SAMPLE_RATE: u32> {
    frame_size: usize,
    /// Lowest gain the suppressor will apply (linear).
    max_attenuation: f32,
    state: Mutex<SuppressorState>,
}

impl<const SAMPLE_RATE: u32> NoiseSuppressor<SAMPLE_RATE> {
    /// `suppress_db` is the maximum attenuation, e.g. -25.0.
    pub fn new(frame_size: usize, suppress_db: f32) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("denoiser frame size must be non-zero");
        }
        if suppress_db > 0.0 {
            anyhow::bail!("suppression must be expressed in negative dB, got {}", suppress_db);
        }

        Ok(Self {
            frame_size,
            max_attenuation: 10f32.powf(suppress_db / 20.0),
            state: Mutex::new(SuppressorState {
                noise_floor: 0.0,
                gain: 1.0,
                primed: false,
            }),
        })
    }

    fn frame_rms(samples: &[i16]) -> f32 {
        let sum_sq: i64 = samples.iter().map(|&s| s as i64 * s as i64).sum();
        ((sum_sq as f32 / samples.len() as f32).sqrt()) / 32768.0
    }
}

impl<const SAMPLE_RATE: u32> Denoise<SAMPLE_RATE> for NoiseSuppressor<SAMPLE_RATE> {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<Pcm<SAMPLE_RATE>> {
        if frame.len() != self.frame_size {
            anyhow::bail!(
                "denoiser expects {} samples, got {}",
                self.frame_size,
                frame.len()
            );
        }

        let rms = Self::frame_rms(frame.data());

        let mut state = self.state.lock().unwrap();

        if !state.primed {
            state.noise_floor = rms;
            state.primed = true;
        } else if rms < state.noise_floor {
            state.noise_floor += (rms - state.noise_floor) * FLOOR_FALL;
        } else {
            state.noise_floor += (rms - state.noise_floor) * FLOOR_RISE;
        }

        // Signal close to the floor gets the full attenuation; signal
        // dominating the floor passes unchanged.
        let snr = rms / (state.noise_floor + RMS_EPSILON);
        let target = if snr <= 1.0 {
            self.max_attenuation
        } else {
            (1.0 - 1.0 / snr).max(self.max_attenuation)
        };
        state.gain += (target - state.gain) * GAIN_SMOOTH;

        let gain = state.gain;
        let out: Vec<i16> = frame
            .data()
            .iter()
            .map(|&s| {
                let scaled = s as f32 * gain;
                scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
            })
            .collect();

        Ok(Pcm::new(out))
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.noise_floor = 0.0;
        state.gain = 1.0;
        state.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, amplitude: i16, seed: &mut u32) -> Vec<i16> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                ((*seed >> 16) as i32 % (amplitude as i32 * 2) - amplitude as i32) as i16
            })
            .collect()
    }

    fn energy(samples: &[i16]) -> i64 {
        samples.iter().map(|&s| s as i64 * s as i64).sum()
    }

    #[test]
    fn test_steady_noise_is_attenuated() {
        let denoiser = NoiseSuppressor::<8000>::new(160, -25.0).unwrap();
        let mut seed = 7;

        let mut last_in = 0i64;
        let mut last_out = 0i64;
        for _ in 0..20 {
            let frame = noise(160, 400, &mut seed);
            last_in = energy(&frame);
            let out = denoiser.process(&Pcm::new(frame)).unwrap();
            last_out = energy(out.data());
        }

        assert!(
            last_out < last_in / 10,
            "steady noise should be suppressed: in={} out={}",
            last_in,
            last_out
        );
    }

    #[test]
    fn test_loud_signal_passes_after_floor_learned() {
        let denoiser = NoiseSuppressor::<8000>::new(160, -25.0).unwrap();
        let mut seed = 3;

        for _ in 0..20 {
            denoiser.process(&Pcm::new(noise(160, 200, &mut seed))).unwrap();
        }

        // A frame 40x above the floor should come through mostly intact
        let loud: Vec<i16> = (0..160).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect();
        let mut out = Pcm::<8000>::silence(160);
        for _ in 0..5 {
            out = denoiser.process(&Pcm::new(loud.clone())).unwrap();
        }
        assert!(
            energy(out.data()) > energy(&loud) / 2,
            "speech-level signal should not be suppressed"
        );
    }

    #[test]
    fn test_rejects_wrong_length() {
        let denoiser = NoiseSuppressor::<8000>::new(160, -25.0).unwrap();
        assert!(denoiser.process(&Pcm::<8000>::silence(100)).is_err());
    }

    #[test]
    fn test_positive_suppress_db_rejected() {
        assert!(NoiseSuppressor::<8000>::new(160, 3.0).is_err());
    }
}
