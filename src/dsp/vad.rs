//! Voice activity detection.

use std::sync::Mutex;

use anyhow::Result;
use crossbeam::atomic::AtomicCell;

use super::{DB_FLOOR, DetectVoice, rms_dbfs};
use crate::audio::Pcm;

/// Adaptation rates for the running noise/signal level estimates.
const NOISE_FALL: f32 = 0.2;
const NOISE_RISE: f32 = 0.01;
const SIGNAL_RISE: f32 = 0.1;
const SIGNAL_FALL: f32 = 0.01;
/// Decision margin above the noise estimate, in dB.
const SPEECH_MARGIN_DB: f32 = 8.0;
/// Probability slope: dB distance from threshold for ~75% confidence.
const PROBABILITY_SLOPE_DB: f32 = 3.0;

struct VadState {
    noise_db: f32,
    signal_db: f32,
    hangover_left: u32,
    primed: bool,
}

/// Energy VAD with an adaptive threshold and hangover.
///
/// Tracks separate running estimates of the noise floor and the speech
/// level in dB; a frame is speech when its energy clears the noise
/// estimate by a fixed margin. Hangover keeps the decision at speech for
/// a short tail after the energy drops, bridging inter-word gaps.
pub struct EnergyVad<const SAMPLE_RATE: u32> {
    frame_size: usize,
    hangover_frames: u32,
    state: Mutex<VadState>,
    probability: AtomicCell<f32>,
}

impl<const SAMPLE_RATE: u32> EnergyVad<SAMPLE_RATE> {
    pub fn new(frame_size: usize, hangover_ms: u32) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("VAD frame size must be non-zero");
        }

        let frame_ms = frame_size as f32 * 1000.0 / SAMPLE_RATE as f32;
        let hangover_frames = (hangover_ms as f32 / frame_ms).round() as u32;

        Ok(Self {
            frame_size,
            hangover_frames,
            state: Mutex::new(VadState {
                noise_db: DB_FLOOR,
                signal_db: DB_FLOOR,
                hangover_left: 0,
                primed: false,
            }),
            probability: AtomicCell::new(0.0),
        })
    }
}

impl<const SAMPLE_RATE: u32> DetectVoice<SAMPLE_RATE> for EnergyVad<SAMPLE_RATE> {
    fn is_speech(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<bool> {
        if frame.len() != self.frame_size {
            anyhow::bail!("VAD expects {} samples, got {}", self.frame_size, frame.len());
        }

        let energy_db = rms_dbfs(frame.data());

        let mut state = self.state.lock().unwrap();

        if !state.primed {
            state.noise_db = energy_db;
            state.signal_db = energy_db;
            state.primed = true;
        } else {
            if energy_db < state.noise_db {
                state.noise_db += (energy_db - state.noise_db) * NOISE_FALL;
            } else {
                state.noise_db += (energy_db - state.noise_db) * NOISE_RISE;
            }
            if energy_db > state.signal_db {
                state.signal_db += (energy_db - state.signal_db) * SIGNAL_RISE;
            } else {
                state.signal_db += (energy_db - state.signal_db) * SIGNAL_FALL;
            }
        }

        let threshold = state.noise_db + SPEECH_MARGIN_DB;
        let distance = energy_db - threshold;
        let probability = 1.0 / (1.0 + (-distance / PROBABILITY_SLOPE_DB).exp());
        self.probability.store(probability);

        let raw_speech = distance > 0.0;
        let speech = if raw_speech {
            state.hangover_left = self.hangover_frames;
            true
        } else if state.hangover_left > 0 {
            state.hangover_left -= 1;
            true
        } else {
            false
        };

        Ok(speech)
    }

    fn probability(&self) -> f32 {
        self.probability.load()
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.noise_db = DB_FLOOR;
        state.signal_db = DB_FLOOR;
        state.hangover_left = 0;
        state.primed = false;
        self.probability.store(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Pcm<8000> {
        Pcm::new(
            (0..160)
                .map(|i| (((i as f32) * 0.5).sin() * 12000.0) as i16)
                .collect(),
        )
    }

    fn quiet_frame(seed: u64) -> Pcm<8000> {
        Pcm::new(
            (0..160)
                .map(|i| (((i as u64 * 31 + seed * 17) % 61) as i16) - 30)
                .collect(),
        )
    }

    #[test]
    fn test_loud_after_quiet_is_speech() {
        let vad = EnergyVad::<8000>::new(160, 0).unwrap();
        for i in 0..10 {
            vad.is_speech(&quiet_frame(i)).unwrap();
        }
        assert!(vad.is_speech(&loud_frame()).unwrap());
        assert!(vad.probability() > 0.9);
    }

    #[test]
    fn test_sustained_quiet_is_silence() {
        let vad = EnergyVad::<8000>::new(160, 0).unwrap();
        let mut decision = true;
        for i in 0..10 {
            decision = vad.is_speech(&quiet_frame(i)).unwrap();
        }
        assert!(!decision);
        assert!(vad.probability() < 0.5);
    }

    #[test]
    fn test_hangover_stretches_speech_tail() {
        // 40ms hangover = 2 frames of 20ms
        let vad = EnergyVad::<8000>::new(160, 40).unwrap();
        for i in 0..10 {
            vad.is_speech(&quiet_frame(i)).unwrap();
        }
        assert!(vad.is_speech(&loud_frame()).unwrap());

        // the next two quiet frames are held as speech, the third is not
        assert!(vad.is_speech(&quiet_frame(20)).unwrap());
        assert!(vad.is_speech(&quiet_frame(21)).unwrap());
        assert!(!vad.is_speech(&quiet_frame(22)).unwrap());
    }

    #[test]
    fn test_probability_in_unit_range() {
        let vad = EnergyVad::<8000>::new(160, 0).unwrap();
        vad.is_speech(&loud_frame()).unwrap();
        let p = vad.probability();
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn test_rejected_frame_leaves_state_unchanged() {
        let vad = EnergyVad::<8000>::new(160, 0).unwrap();
        vad.is_speech(&loud_frame()).unwrap();
        let before = vad.probability();

        assert!(vad.is_speech(&Pcm::<8000>::silence(80)).is_err());
        assert_eq!(vad.probability(), before);
    }
}
