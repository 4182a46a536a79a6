//! Automatic gain control.

use std::sync::Mutex;

use anyhow::Result;
use crossbeam::atomic::AtomicCell;

use super::{ControlGain, rms_dbfs};
use crate::audio::Pcm;

/// Below this input level the gain is frozen rather than ramped up, so
/// background noise in pauses is not amplified.
const GATE_THRESHOLD_DBFS: f32 = -50.0;
/// Hard output ceiling.
const LIMITER_DBFS: f32 = -1.0;

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Time constant (ms) to a per-frame smoothing coefficient.
fn time_to_coeff(time_ms: f32, frame_ms: f32) -> f32 {
    if time_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (-frame_ms / time_ms).exp()
}

#[derive(Debug, Clone, Copy)]
pub struct AgcConfig {
    pub target_level_dbfs: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            target_level_dbfs: -6.0,
            min_gain_db: -12.0,
            max_gain_db: 30.0,
            attack_ms: 10.0,
            release_ms: 100.0,
        }
    }
}

struct AgcState {
    gain_db: f32,
}

/// Frame-rate AGC with asymmetric attack/release and a hard limiter.
///
/// Gain moves toward `target_level_dbfs - input_rms`, falling fast
/// (attack) and rising slowly (release), clamped to the configured gain
/// range. The limiter rescales any frame whose peak would exceed the
/// ceiling after gain.
pub struct AdaptiveGain<const SAMPLE_RATE: u32> {
    frame_size: usize,
    config: AgcConfig,
    attack_coeff: f32,
    release_coeff: f32,
    state: Mutex<AgcState>,
    current_gain: AtomicCell<f32>,
}

impl<const SAMPLE_RATE: u32> AdaptiveGain<SAMPLE_RATE> {
    pub fn new(frame_size: usize, config: AgcConfig) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("AGC frame size must be non-zero");
        }
        if config.min_gain_db > config.max_gain_db {
            anyhow::bail!(
                "AGC min gain {} dB exceeds max gain {} dB",
                config.min_gain_db,
                config.max_gain_db
            );
        }

        let frame_ms = frame_size as f32 * 1000.0 / SAMPLE_RATE as f32;

        Ok(Self {
            frame_size,
            config,
            attack_coeff: time_to_coeff(config.attack_ms, frame_ms),
            release_coeff: time_to_coeff(config.release_ms, frame_ms),
            state: Mutex::new(AgcState { gain_db: 0.0 }),
            current_gain: AtomicCell::new(1.0),
        })
    }
}

impl<const SAMPLE_RATE: u32> ControlGain<SAMPLE_RATE> for AdaptiveGain<SAMPLE_RATE> {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<Pcm<SAMPLE_RATE>> {
        if frame.len() != self.frame_size {
            anyhow::bail!("AGC expects {} samples, got {}", self.frame_size, frame.len());
        }

        let rms_db = rms_dbfs(frame.data());

        let mut state = self.state.lock().unwrap();

        if rms_db > GATE_THRESHOLD_DBFS {
            let desired = (self.config.target_level_dbfs - rms_db)
                .clamp(self.config.min_gain_db, self.config.max_gain_db);
            let coeff = if desired < state.gain_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            state.gain_db += (desired - state.gain_db) * coeff;
        }

        let mut gain = db_to_linear(state.gain_db);

        // Limiter: never let the gained peak cross the ceiling
        let peak = frame
            .data()
            .iter()
            .map(|&s| (s as i32).abs())
            .max()
            .unwrap_or(0) as f32
            / 32768.0;
        let ceiling = db_to_linear(LIMITER_DBFS);
        if peak * gain > ceiling {
            gain = ceiling / peak;
        }

        self.current_gain.store(gain);

        let out: Vec<i16> = frame
            .data()
            .iter()
            .map(|&s| (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();

        Ok(Pcm::new(out))
    }

    fn gain(&self) -> f32 {
        self.current_gain.load()
    }

    fn reset(&self) {
        self.state.lock().unwrap().gain_db = 0.0;
        self.current_gain.store(1.0);
    }
}
