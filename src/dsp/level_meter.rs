//! Audio level metering.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use crossbeam::atomic::AtomicCell;

use super::{DB_FLOOR, MeterLevel};
use crate::audio::Pcm;

/// Meter ballistics: fast rise, slow fall, like an analog VU meter.
const ATTACK_MS: f32 = 5.0;
const RELEASE_MS: f32 = 100.0;
/// Samples at or above this magnitude count as clipped.
const CLIP_MAGNITUDE: i32 = 32760;
const SILENCE_THRESHOLD_DBFS: f32 = -60.0;

fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return DB_FLOOR;
    }
    (20.0 * linear.log10()).max(DB_FLOOR)
}

struct MeterState {
    peak_smooth: f32,
    rms_smooth: f32,
}

/// Peak/RMS level meter with attack/release smoothing.
///
/// Readouts are published through atomics so they can be polled from a
/// UI or control thread without contending with the processing path.
pub struct LevelMeter<const SAMPLE_RATE: u32> {
    frame_size: usize,
    attack_coeff: f32,
    release_coeff: f32,
    state: Mutex<MeterState>,
    peak_db: AtomicCell<f32>,
    rms_db: AtomicCell<f32>,
    clipped: AtomicBool,
    clip_count: AtomicU64,
}

impl<const SAMPLE_RATE: u32> LevelMeter<SAMPLE_RATE> {
    pub fn new(frame_size: usize) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("level meter frame size must be non-zero");
        }

        let frame_ms = frame_size as f32 * 1000.0 / SAMPLE_RATE as f32;
        let coeff = |time_ms: f32| 1.0 - (-frame_ms / time_ms).exp();

        Ok(Self {
            frame_size,
            attack_coeff: coeff(ATTACK_MS),
            release_coeff: coeff(RELEASE_MS),
            state: Mutex::new(MeterState {
                peak_smooth: 0.0,
                rms_smooth: 0.0,
            }),
            peak_db: AtomicCell::new(DB_FLOOR),
            rms_db: AtomicCell::new(DB_FLOOR),
            clipped: AtomicBool::new(false),
            clip_count: AtomicU64::new(0),
        })
    }

    /// Total clipped samples seen since construction or reset.
    pub fn clip_count(&self) -> u64 {
        self.clip_count.load(Ordering::Relaxed)
    }
}

impl<const SAMPLE_RATE: u32> MeterLevel<SAMPLE_RATE> for LevelMeter<SAMPLE_RATE> {
    fn process(&self, frame: &Pcm<SAMPLE_RATE>) -> Result<()> {
        if frame.len() != self.frame_size {
            anyhow::bail!(
                "level meter expects {} samples, got {}",
                self.frame_size,
                frame.len()
            );
        }

        let mut peak = 0i32;
        let mut sum_sq = 0i64;
        let mut clips = 0u64;
        for &s in frame.data() {
            let magnitude = (s as i32).abs();
            peak = peak.max(magnitude);
            sum_sq += s as i64 * s as i64;
            if magnitude >= CLIP_MAGNITUDE {
                clips += 1;
            }
        }

        let peak_lin = peak as f32 / 32768.0;
        let rms_lin = ((sum_sq as f32 / frame.len() as f32).sqrt()) / 32768.0;

        let mut state = self.state.lock().unwrap();
        let smooth = |current: &mut f32, input: f32, attack: f32, release: f32| {
            let coeff = if input > *current { attack } else { release };
            *current += (input - *current) * coeff;
        };
        smooth(&mut state.peak_smooth, peak_lin, self.attack_coeff, self.release_coeff);
        smooth(&mut state.rms_smooth, rms_lin, self.attack_coeff, self.release_coeff);

        self.peak_db.store(linear_to_db(state.peak_smooth));
        self.rms_db.store(linear_to_db(state.rms_smooth));
        self.clipped.store(clips > 0, Ordering::Relaxed);
        self.clip_count.fetch_add(clips, Ordering::Relaxed);

        Ok(())
    }

    fn level_db(&self) -> f32 {
        self.rms_db.load()
    }

    fn peak_db(&self) -> f32 {
        self.peak_db.load()
    }

    fn rms_db(&self) -> f32 {
        self.rms_db.load()
    }

    fn is_silence(&self) -> bool {
        self.rms_db.load() < SILENCE_THRESHOLD_DBFS
    }

    fn is_clipping(&self) -> bool {
        self.clipped.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.peak_smooth = 0.0;
        state.rms_smooth = 0.0;
        self.peak_db.store(DB_FLOOR);
        self.rms_db.store(DB_FLOOR);
        self.clipped.store(false, Ordering::Relaxed);
        self.clip_count.store(0, Ordering::Relaxed);
    }
}
