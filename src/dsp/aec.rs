//! Acoustic echo cancellation.

use std::sync::Mutex;

use anyhow::Result;
use tracing::debug;

use super::EchoCancel;
use crate::audio::{AudioSample, Pcm};

const DEFAULT_STEP_SIZE: f32 = 0.5;
const REGULARIZATION: f32 = 1e-3;

struct NlmsState {
    /// Adaptive filter taps, newest reference sample first.
    weights: Vec<f32>,
    /// Reference sample history, same ordering as `weights`.
    history: Vec<f32>,
    /// Running energy of `history`.
    power: f32,
}

impl NlmsState {
    fn new(taps: usize) -> Self {
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; taps],
            power: 0.0,
        }
    }

    fn clear(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.history.iter_mut().for_each(|h| *h = 0.0);
        self.power = 0.0;
    }

    fn cancel_sample(&mut self, captured: f32, reference: f32, step: f32) -> f32 {
        // Shift the reference into the history window
        let dropped = self.history.pop().unwrap_or(0.0);
        self.history.insert(0, reference);
        self.power += reference * reference - dropped * dropped;
        if self.power < 0.0 {
            self.power = 0.0;
        }

        let estimate: f32 = self
            .weights
            .iter()
            .zip(self.history.iter())
            .map(|(w, h)| w * h)
            .sum();

        let error = captured - estimate;

        // NLMS update, normalized by reference energy
        let scale = step * error / (self.power + REGULARIZATION);
        for (w, h) in self.weights.iter_mut().zip(self.history.iter()) {
            *w += scale * h;
        }

        error
    }
}

/// Normalized-LMS echo canceller.
///
/// Models the echo path with an adaptive FIR filter over the playback
/// reference and subtracts the estimate from the captured signal. The
/// filter length bounds the echo tail that can be cancelled.
pub struct NlmsEchoCanceller<const SAMPLE_RATE: u32> {
    frame_size: usize,
    step_size: f32,
    state: Mutex<NlmsState>,
}

impl<const SAMPLE_RATE: u32> NlmsEchoCanceller<SAMPLE_RATE> {
    pub fn new(frame_size: usize, filter_taps: usize) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("AEC frame size must be non-zero");
        }
        if filter_taps == 0 {
            anyhow::bail!("AEC filter length must be non-zero");
        }

        debug!(frame_size, filter_taps, "echo canceller created");

        Ok(Self {
            frame_size,
            step_size: DEFAULT_STEP_SIZE,
            state: Mutex::new(NlmsState::new(filter_taps)),
        })
    }
}

impl<const SAMPLE_RATE: u32> EchoCancel<SAMPLE_RATE> for NlmsEchoCanceller<SAMPLE_RATE> {
    fn process(
        &self,
        captured: &Pcm<SAMPLE_RATE>,
        reference: &Pcm<SAMPLE_RATE>,
    ) -> Result<Pcm<SAMPLE_RATE>> {
        if captured.len() != self.frame_size || reference.len() != self.frame_size {
            anyhow::bail!(
                "AEC expects {} samples, got captured={} reference={}",
                self.frame_size,
                captured.len(),
                reference.len()
            );
        }

        let mut state = self.state.lock().unwrap();
        let out: Vec<i16> = captured
            .data()
            .iter()
            .zip(reference.data().iter())
            .map(|(&near, &far)| {
                let cleaned = state.cancel_sample(
                    near.to_f64_normalized() as f32,
                    far.to_f64_normalized() as f32,
                    self.step_size,
                );
                i16::from_f64_normalized(cleaned as f64)
            })
            .collect();

        Ok(Pcm::new(out))
    }

    fn reset(&self) {
        self.state.lock().unwrap().clear();
    }
}
