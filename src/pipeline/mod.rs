//! Pipeline orchestrator.
//!
//! [`VoicePipeline`] sequences the per-frame DSP chain and owns the
//! jitter buffer:
//!
//! - capture path: AEC -> denoise -> VAD -> (speech: AGC -> level meter
//!   -> encode) / (silence: comfort-noise analysis, nothing sent)
//! - receive path: decode -> jitter buffer insert
//! - playout path: jitter buffer pull with comfort-noise concealment
//!
//! The stage order is load-bearing: echo must be cancelled before
//! denoising, the VAD must see the denoised signal, and gain is applied
//! only to frames already classified as speech.
//!
//! All calls are synchronous and non-blocking; capture and receive may
//! run on independent cadences against one pipeline instance.

pub mod config;
pub mod stats;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use anyhow::{Context, Result};
use crossbeam::atomic::AtomicCell;
use tracing::{debug, info};

use crate::audio::{AudioFrame, Pcm};
use crate::codec::{AudioCodec, G711Codec};
use crate::dsp::{
    AdaptiveGain, ComfortNoise, ComfortNoiseGenerator, ControlGain, Denoise, DetectVoice,
    EchoCancel, EnergyVad, LevelMeter, MeterLevel, NlmsEchoCanceller, NoiseSuppressor,
};
use crate::net::{EncodedPacket, JitterBuffer, JitterStats};

pub use config::PipelineConfig;
pub use stats::{PipelineStats, PipelineStatsSnapshot};

/// Call-level state. Per-frame speech/silence classification is not a
/// state: it is recomputed every frame with no hysteresis here (any
/// hysteresis lives inside the VAD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No frames processed yet (or just reset).
    Idle,
    /// Frames flowing.
    Active,
}

/// Per-call voice pipeline.
///
/// Owns one collaborator per DSP role behind its capability trait, one
/// jitter buffer, and the call-lifetime statistics. Collaborators can be
/// swapped with the `with_*` builder methods before the call starts.
pub struct VoicePipeline<const SAMPLE_RATE: u32> {
    frame_size: usize,
    aec: Box<dyn EchoCancel<SAMPLE_RATE>>,
    denoiser: Box<dyn Denoise<SAMPLE_RATE>>,
    vad: Box<dyn DetectVoice<SAMPLE_RATE>>,
    agc: Box<dyn ControlGain<SAMPLE_RATE>>,
    comfort: Box<dyn ComfortNoise<SAMPLE_RATE>>,
    meter: Box<dyn MeterLevel<SAMPLE_RATE>>,
    codec: Box<dyn AudioCodec<SAMPLE_RATE>>,
    jitter: JitterBuffer<SAMPLE_RATE>,
    stats: PipelineStats,
    state: AtomicCell<PipelineState>,
    /// Capture-side sample clock; advances every frame, sent or not, so
    /// suppressed silence leaves timestamp gaps on the wire.
    clock: AtomicU32,
    /// Wire sequence number; advances only per sent packet.
    sequence: AtomicU16,
    capture_muted: AtomicBool,
    playback_muted: AtomicBool,
    playback_volume: AtomicCell<f32>,
}

impl<const SAMPLE_RATE: u32> VoicePipeline<SAMPLE_RATE> {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let frame_size = config.frame_size(SAMPLE_RATE)?;

        let jitter_config = crate::net::JitterConfig {
            frame_size,
            ..config.jitter.clone()
        };

        let pipeline = Self {
            frame_size,
            aec: Box::new(NlmsEchoCanceller::new(frame_size, config.aec_filter_taps)?),
            denoiser: Box::new(NoiseSuppressor::new(frame_size, config.denoise_suppress_db)?),
            vad: Box::new(EnergyVad::new(frame_size, config.vad_hangover_ms)?),
            agc: Box::new(AdaptiveGain::new(frame_size, config.agc)?),
            comfort: Box::new(ComfortNoiseGenerator::new(frame_size)?),
            meter: Box::new(LevelMeter::new(frame_size)?),
            codec: Box::new(G711Codec::new(config.law, frame_size)?),
            jitter: JitterBuffer::new(jitter_config)?,
            stats: PipelineStats::default(),
            state: AtomicCell::new(PipelineState::Idle),
            clock: AtomicU32::new(0),
            sequence: AtomicU16::new(0),
            capture_muted: AtomicBool::new(false),
            playback_muted: AtomicBool::new(false),
            playback_volume: AtomicCell::new(1.0),
        };

        info!(
            sample_rate = SAMPLE_RATE,
            frame_size,
            law = ?config.law,
            "voice pipeline created"
        );

        Ok(pipeline)
    }

    pub fn with_echo_canceller(mut self, aec: Box<dyn EchoCancel<SAMPLE_RATE>>) -> Self {
        self.aec = aec;
        self
    }

    pub fn with_denoiser(mut self, denoiser: Box<dyn Denoise<SAMPLE_RATE>>) -> Self {
        self.denoiser = denoiser;
        self
    }

    pub fn with_voice_detector(mut self, vad: Box<dyn DetectVoice<SAMPLE_RATE>>) -> Self {
        self.vad = vad;
        self
    }

    pub fn with_gain_control(mut self, agc: Box<dyn ControlGain<SAMPLE_RATE>>) -> Self {
        self.agc = agc;
        self
    }

    pub fn with_comfort_noise(mut self, comfort: Box<dyn ComfortNoise<SAMPLE_RATE>>) -> Self {
        self.comfort = comfort;
        self
    }

    pub fn with_level_meter(mut self, meter: Box<dyn MeterLevel<SAMPLE_RATE>>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_codec(mut self, codec: Box<dyn AudioCodec<SAMPLE_RATE>>) -> Self {
        self.codec = codec;
        self
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn state(&self) -> PipelineState {
        self.state.load()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run one captured frame through the capture chain.
    ///
    /// Returns the encoded packet for speech, or `None` for suppressed
    /// silence - silence is never transmitted. A frame of the wrong
    /// length fails the call before any stage runs; a collaborator fault
    /// propagates unmodified. Neither interrupts later capture calls.
    pub fn process_capture(
        &self,
        captured: &Pcm<SAMPLE_RATE>,
        reference: &Pcm<SAMPLE_RATE>,
    ) -> Result<Option<EncodedPacket>> {
        if captured.len() != self.frame_size || reference.len() != self.frame_size {
            anyhow::bail!(
                "capture expects {}-sample frames, got captured={} reference={}",
                self.frame_size,
                captured.len(),
                reference.len()
            );
        }

        self.state.store(PipelineState::Active);

        let muted;
        let captured = if self.capture_muted.load(Ordering::Relaxed) {
            muted = Pcm::silence(self.frame_size);
            &muted
        } else {
            captured
        };

        let cleaned = self
            .aec
            .process(captured, reference)
            .context("echo canceller failed")?;
        let denoised = self.denoiser.process(&cleaned).context("denoiser failed")?;
        let speech = self.vad.is_speech(&denoised).context("VAD failed")?;

        // One frame of sample clock passes whether or not we transmit
        let timestamp = self
            .clock
            .fetch_add(self.frame_size as u32, Ordering::Relaxed);
        self.stats.record_frame();

        if speech {
            let leveled = self.agc.process(&denoised).context("AGC failed")?;
            self.meter.process(&leveled).context("level meter failed")?;
            let payload = self.codec.encode(&leveled).context("encode failed")?;
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

            self.stats.record_speech(payload.len());
            Ok(Some(EncodedPacket::new(sequence, timestamp, payload)))
        } else {
            self.comfort
                .analyze(&denoised)
                .context("comfort noise analysis failed")?;
            self.stats.record_silence();
            Ok(None)
        }
    }

    /// Decode an incoming packet and hand it to the jitter buffer.
    ///
    /// The received counter advances unconditionally: a packet the
    /// jitter buffer ends up dropping still arrived at the transport.
    pub fn receive_packet(&self, packet: &EncodedPacket) -> Result<()> {
        self.stats.record_packet_received();

        let samples = self.codec.decode(&packet.payload).context("decode failed")?;
        let frame = AudioFrame::new(packet.timestamp, packet.sequence, samples);
        self.jitter.put_frame(frame)
    }

    /// Pull playback audio. Gaps are concealed with comfort noise
    /// matching the analyzed background; no other DSP runs on the way
    /// out. Always returns exactly `len` samples, immediately.
    pub fn get_playback_audio(&self, len: usize) -> Pcm<SAMPLE_RATE> {
        if self.playback_muted.load(Ordering::Relaxed) {
            // keep the playout cursor moving while muted
            self.jitter.get(len);
            return Pcm::silence(len);
        }

        let buffer = self.jitter.get_concealed(len, |n| self.comfort.generate(n));

        let volume = self.playback_volume.load();
        if (volume - 1.0).abs() < f32::EPSILON {
            return buffer;
        }
        let scaled: Vec<i16> = buffer
            .data()
            .iter()
            .map(|&s| (s as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();
        Pcm::new(scaled)
    }

    /// Smoothed capture level in dBFS (speech path only).
    pub fn get_level_db(&self) -> f32 {
        self.meter.level_db()
    }

    /// Speech probability of the most recent capture frame.
    pub fn get_speech_probability(&self) -> f32 {
        self.vad.probability()
    }

    pub fn get_jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    pub fn set_capture_muted(&self, muted: bool) {
        self.capture_muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_playback_muted(&self, muted: bool) {
        self.playback_muted.store(muted, Ordering::Relaxed);
    }

    /// Playback volume in `[0, 1]`; values outside are clamped.
    pub fn set_playback_volume(&self, volume: f32) {
        self.playback_volume.store(volume.clamp(0.0, 1.0));
    }

    /// Reset every collaborator and the jitter buffer for call
    /// re-establishment. Statistics are call-lifetime and deliberately
    /// survive; use [`PipelineStats::reset`] to clear them explicitly.
    pub fn reset(&self) {
        self.aec.reset();
        self.denoiser.reset();
        self.vad.reset();
        self.agc.reset();
        self.comfort.reset();
        self.meter.reset();
        self.codec.reset();
        self.jitter.reset();
        self.clock.store(0, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Relaxed);
        self.state.store(PipelineState::Idle);
        debug!("pipeline reset");
    }
}
