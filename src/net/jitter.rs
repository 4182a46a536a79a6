//! Adaptive jitter buffer.
//!
//! Absorbs network delay variation, reordering, loss, and duplication,
//! presenting a steady pull-based stream to the playout path. Pending
//! frames are keyed by timestamp; a playout cursor advances strictly
//! monotonically and never waits for a late packet.
//!
//! Key design points:
//! - Timestamps are authoritative for playout; sequence numbers are
//!   advisory (loss statistics only).
//! - 32-bit timestamps and 16-bit sequence numbers are unwrapped into
//!   64-bit extended counters, so wraparound never reads as a jump.
//! - The target delay adapts to an EWMA of inter-arrival deviation
//!   between timestamp steps and sequence-implied steps, clamped to the
//!   configured delay window.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use tracing::debug;

use crate::audio::{AudioFrame, Pcm};

/// EWMA factor for the inter-arrival jitter estimate.
const JITTER_SMOOTH: f32 = 0.1;
/// Safety margin applied to the jitter estimate when deriving the
/// target delay.
const DEFAULT_SAFETY_FACTOR: f32 = 2.0;
/// Largest upward / downward target-delay move per accepted packet (ms).
/// Ramping up fast protects against an onsetting jitter burst; backing
/// off slowly avoids oscillation.
const DELAY_STEP_UP_MS: f32 = 10.0;
const DELAY_STEP_DOWN_MS: f32 = 5.0;
/// Hysteresis before the target is walked back down (ms).
const DELAY_SHRINK_THRESHOLD_MS: f32 = 10.0;

/// Jitter buffer configuration. `validate` fails fast on nonsense.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Samples per frame as sent by the far end.
    pub frame_size: usize,
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub initial_delay_ms: u32,
    /// Maximum pending slots; exceeding it evicts the oldest.
    pub capacity: usize,
    pub safety_factor: f32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            frame_size: 160,
            min_delay_ms: 20,
            max_delay_ms: 200,
            initial_delay_ms: 60,
            capacity: 64,
            safety_factor: DEFAULT_SAFETY_FACTOR,
        }
    }
}

impl JitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            anyhow::bail!("jitter buffer frame size must be non-zero");
        }
        if self.capacity == 0 {
            anyhow::bail!("jitter buffer capacity must be non-zero");
        }
        if self.min_delay_ms > self.max_delay_ms {
            anyhow::bail!(
                "jitter min delay {}ms exceeds max delay {}ms",
                self.min_delay_ms,
                self.max_delay_ms
            );
        }
        if self.initial_delay_ms < self.min_delay_ms || self.initial_delay_ms > self.max_delay_ms {
            anyhow::bail!(
                "jitter initial delay {}ms outside [{}, {}]ms",
                self.initial_delay_ms,
                self.min_delay_ms,
                self.max_delay_ms
            );
        }
        if self.safety_factor <= 0.0 {
            anyhow::bail!("jitter safety factor must be positive");
        }
        Ok(())
    }
}

/// Snapshot of jitter buffer statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterStats {
    /// Every packet offered to `put`, accepted or not.
    pub packets_received: u64,
    /// Frames consumed by playout.
    pub packets_played: u64,
    pub duplicates: u64,
    pub late_drops: u64,
    pub underruns: u64,
    /// Slots evicted for capacity or passed over by the cursor.
    pub discarded: u64,
    /// Advisory loss count from sequence-number gaps.
    pub packets_lost: u64,
    pub current_delay_ms: f32,
    pub jitter_ms: f32,
    pub buffered_frames: usize,
}

/// Unwrap a 32-bit counter onto a 64-bit line, choosing the unrolling
/// closest to `reference`.
fn extend_u32(reference: u64, value: u32) -> u64 {
    const MODULUS: i128 = 1 << 32;
    let reference = reference as i128;
    let value = value as i128;

    let cycles = (reference - value).div_euclid(MODULUS);
    let below = cycles * MODULUS + value;
    let above = below + MODULUS;
    let best = if (reference - below).abs() <= (above - reference).abs() {
        below
    } else {
        above
    };
    best.max(0) as u64
}

/// Same for 16-bit sequence numbers.
fn extend_u16(reference: i64, value: u16) -> i64 {
    const MODULUS: i64 = 1 << 16;
    let value = value as i64;

    let cycles = (reference - value).div_euclid(MODULUS);
    let below = cycles * MODULUS + value;
    let above = below + MODULUS;
    if (reference - below).abs() <= (above - reference).abs() {
        below
    } else {
        above
    }
}

struct JitterState<const SAMPLE_RATE: u32> {
    /// Pending frames keyed by extended timestamp.
    slots: BTreeMap<u64, Pcm<SAMPLE_RATE>>,
    started: bool,
    /// Next sample-clock position to emit (extended).
    cursor: u64,
    /// Most recent extended timestamp / sequence, used as unwrap anchors.
    ts_anchor: u64,
    seq_anchor: i64,
    /// Tail of a partially consumed frame, positioned at `cursor`.
    leftover: Vec<i16>,
    target_delay_ms: f32,
    jitter_ewma_ms: f32,
    last_arrival: Option<(u64, i64)>,
    /// Advisory loss accounting.
    first_seq: Option<i64>,
    highest_seq: i64,
    accepted: u64,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    packets_received: u64,
    packets_played: u64,
    duplicates: u64,
    late_drops: u64,
    underruns: u64,
    discarded: u64,
}

impl<const SAMPLE_RATE: u32> JitterState<SAMPLE_RATE> {
    fn new(initial_delay_ms: u32) -> Self {
        Self {
            slots: BTreeMap::new(),
            started: false,
            cursor: 0,
            ts_anchor: 0,
            seq_anchor: 0,
            leftover: Vec::new(),
            target_delay_ms: initial_delay_ms as f32,
            jitter_ewma_ms: 0.0,
            last_arrival: None,
            first_seq: None,
            highest_seq: 0,
            accepted: 0,
            stats: Counters::default(),
        }
    }

    fn target_delay_samples(&self) -> u64 {
        (self.target_delay_ms * SAMPLE_RATE as f32 / 1000.0) as u64
    }

    fn packets_lost(&self) -> u64 {
        match self.first_seq {
            Some(first) => {
                let expected = (self.highest_seq - first + 1).max(0) as u64;
                expected.saturating_sub(self.accepted + self.stats.duplicates)
            }
            None => 0,
        }
    }

    /// Drop slots the cursor has already passed; they can never play.
    fn discard_stale(&mut self) {
        let live = self.slots.split_off(&self.cursor);
        let stale = std::mem::replace(&mut self.slots, live);
        if !stale.is_empty() {
            self.stats.discarded += stale.len() as u64;
            debug!(count = stale.len(), "discarded stale jitter slots");
        }
    }
}

/// Pull-based adaptive jitter buffer.
///
/// All mutating calls (`put`, `get`, `reset`) exclude each other behind
/// a write lock; `stats` and `delay_ms` take the read lock and may run
/// concurrently with each other. One buffer belongs to exactly one call
/// leg and is never shared across calls.
pub struct JitterBuffer<const SAMPLE_RATE: u32> {
    config: JitterConfig,
    state: RwLock<JitterState<SAMPLE_RATE>>,
}

impl<const SAMPLE_RATE: u32> JitterBuffer<SAMPLE_RATE> {
    pub fn new(config: JitterConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            frame_size = config.frame_size,
            min = config.min_delay_ms,
            max = config.max_delay_ms,
            initial = config.initial_delay_ms,
            "jitter buffer created"
        );

        let initial = config.initial_delay_ms;
        Ok(Self {
            config,
            state: RwLock::new(JitterState::new(initial)),
        })
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Insert a received, decoded frame. Never blocks; anomalies are
    /// counted, not raised.
    pub fn put(&self, frame: Pcm<SAMPLE_RATE>, timestamp: u32, sequence: u16) -> Result<()> {
        if frame.len() != self.config.frame_size {
            anyhow::bail!(
                "jitter buffer expects {}-sample frames, got {}",
                self.config.frame_size,
                frame.len()
            );
        }

        let mut state = self.state.write().unwrap();
        state.stats.packets_received += 1;

        let (ext_ts, ext_seq) = if state.started {
            (
                extend_u32(state.ts_anchor, timestamp),
                extend_u16(state.seq_anchor, sequence),
            )
        } else {
            (timestamp as u64, sequence as i64)
        };
        state.ts_anchor = ext_ts;
        state.seq_anchor = ext_seq;

        if !state.started {
            state.started = true;
            state.cursor = ext_ts;
            debug!(timestamp, sequence, "jitter buffer primed");
        }

        if state.slots.contains_key(&ext_ts) {
            state.stats.duplicates += 1;
            debug!(timestamp, sequence, "duplicate frame dropped");
            return Ok(());
        }

        // Anything the cursor has left more than a target delay behind
        // can never be played.
        let late_horizon = state.cursor.saturating_sub(state.target_delay_samples());
        if ext_ts < late_horizon {
            state.stats.late_drops += 1;
            debug!(timestamp, sequence, "late frame dropped");
            return Ok(());
        }

        if state.slots.len() >= self.config.capacity {
            let oldest = state.slots.keys().next().copied();
            if let Some(oldest) = oldest {
                state.slots.remove(&oldest);
                state.stats.discarded += 1;
                debug!(evicted = oldest, "capacity reached, evicted oldest slot");
            }
        }

        state.slots.insert(ext_ts, frame);

        self.update_estimator(&mut state, ext_ts, ext_seq);

        state.first_seq.get_or_insert(ext_seq);
        state.highest_seq = state.highest_seq.max(ext_seq);
        state.accepted += 1;

        Ok(())
    }

    /// `put` for callers holding a decoded [`AudioFrame`].
    pub fn put_frame(&self, frame: AudioFrame<i16, SAMPLE_RATE>) -> Result<()> {
        self.put(frame.samples, frame.timestamp, frame.sequence)
    }

    /// Nudge the target delay toward the observed inter-arrival jitter.
    fn update_estimator(&self, state: &mut JitterState<SAMPLE_RATE>, ext_ts: u64, ext_seq: i64) {
        let frame_ms = self.config.frame_size as f32 * 1000.0 / SAMPLE_RATE as f32;

        if let Some((prev_ts, prev_seq)) = state.last_arrival {
            let ts_step = ext_ts as i64 - prev_ts as i64;
            let expected = (ext_seq - prev_seq) * self.config.frame_size as i64;
            let deviation_samples = (ts_step - expected).unsigned_abs();
            let deviation_ms = (deviation_samples as f32 * 1000.0 / SAMPLE_RATE as f32)
                .min(self.config.max_delay_ms as f32);

            state.jitter_ewma_ms += (deviation_ms - state.jitter_ewma_ms) * JITTER_SMOOTH;

            let optimal = (state.jitter_ewma_ms * self.config.safety_factor + frame_ms).clamp(
                self.config.min_delay_ms as f32,
                self.config.max_delay_ms as f32,
            );

            if state.target_delay_ms < optimal {
                let step = (optimal - state.target_delay_ms).min(DELAY_STEP_UP_MS);
                state.target_delay_ms += step;
            } else if state.target_delay_ms > optimal + DELAY_SHRINK_THRESHOLD_MS {
                let step = (state.target_delay_ms - optimal).min(DELAY_STEP_DOWN_MS);
                state.target_delay_ms -= step;
            }
        }

        state.last_arrival = Some((ext_ts, ext_seq));
    }

    /// Pull exactly `len` samples, substituting silence for anything
    /// missing. Never blocks.
    pub fn get(&self, len: usize) -> Pcm<SAMPLE_RATE> {
        self.get_concealed(len, |n| Pcm::silence(n))
    }

    /// Pull exactly `len` samples, filling gaps from `conceal` (comfort
    /// noise, PLC, ...). `conceal` must return a buffer of the requested
    /// length; shorter output is padded with silence.
    pub fn get_concealed<F>(&self, len: usize, mut conceal: F) -> Pcm<SAMPLE_RATE>
    where
        F: FnMut(usize) -> Pcm<SAMPLE_RATE>,
    {
        let mut state = self.state.write().unwrap();
        let frame_size = self.config.frame_size;
        let mut out: Vec<i16> = Vec::with_capacity(len);

        while out.len() < len {
            let need = len - out.len();

            if !state.leftover.is_empty() {
                let take = need.min(state.leftover.len());
                out.extend(state.leftover.drain(..take));
                state.cursor += take as u64;
                continue;
            }

            if !state.started {
                // No timeline yet: emit silence without moving anything
                let mut fill = conceal(need).into_inner();
                fill.resize(need, 0);
                out.extend(fill);
                state.stats.underruns += need.div_ceil(frame_size) as u64;
                break;
            }

            state.discard_stale();

            let cursor_key = state.cursor;
            if let Some(frame) = state.slots.remove(&cursor_key) {
                let samples = frame.into_inner();
                let take = need.min(samples.len());
                out.extend(&samples[..take]);
                state.leftover = samples[take..].to_vec();
                state.cursor += take as u64;
                state.stats.packets_played += 1;
                continue;
            }

            // Gap: substitute up to the next buffered slot, one
            // frame-sized chunk at a time.
            let gap = state
                .slots
                .range(state.cursor..)
                .next()
                .map(|(&ts, _)| (ts - state.cursor) as usize)
                .unwrap_or(need);
            let fill_len = need.min(gap.max(1)).min(frame_size);

            let mut fill = conceal(fill_len).into_inner();
            fill.resize(fill_len, 0);
            out.extend(fill);
            state.cursor += fill_len as u64;
            state.stats.underruns += 1;
        }

        Pcm::new(out)
    }

    /// Read-only statistics snapshot. Idempotent.
    pub fn stats(&self) -> JitterStats {
        let state = self.state.read().unwrap();
        JitterStats {
            packets_received: state.stats.packets_received,
            packets_played: state.stats.packets_played,
            duplicates: state.stats.duplicates,
            late_drops: state.stats.late_drops,
            underruns: state.stats.underruns,
            discarded: state.stats.discarded,
            packets_lost: state.packets_lost(),
            current_delay_ms: state.target_delay_ms,
            jitter_ms: state.jitter_ewma_ms,
            buffered_frames: state.slots.len(),
        }
    }

    /// Current target delay in milliseconds.
    pub fn delay_ms(&self) -> f32 {
        self.state.read().unwrap().target_delay_ms
    }

    /// Drop all pending audio and return to the initial configuration.
    /// Used on call re-establishment or after a detected discontinuity.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap();
        *state = JitterState::new(self.config.initial_delay_ms);
        debug!("jitter buffer reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 320;

    fn buffer() -> JitterBuffer<8000> {
        JitterBuffer::new(JitterConfig {
            frame_size: FRAME,
            ..JitterConfig::default()
        })
        .unwrap()
    }

    /// A frame whose samples all carry `tag`, so playout order is
    /// visible in the output.
    fn tagged(tag: i16) -> Pcm<8000> {
        Pcm::new(vec![tag; FRAME])
    }

    fn tags_of(buffer: &Pcm<8000>) -> Vec<i16> {
        buffer
            .data()
            .chunks(FRAME)
            .map(|chunk| chunk[0])
            .collect()
    }

    #[test]
    fn test_in_order_playout() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(2), 320, 1).unwrap();
        jb.put(tagged(3), 640, 2).unwrap();

        let out = jb.get(960);
        assert_eq!(out.len(), 960);
        assert_eq!(tags_of(&out), vec![1, 2, 3]);
        assert_eq!(jb.stats().underruns, 0);
    }

    #[test]
    fn test_reordered_arrival_plays_in_timestamp_order() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(3), 640, 2).unwrap();
        jb.put(tagged(2), 320, 1).unwrap();

        let out = jb.get(960);
        assert_eq!(tags_of(&out), vec![1, 2, 3]);
        assert_eq!(jb.stats().underruns, 0);
    }

    #[test]
    fn test_all_insert_orders_play_exactly_once_ascending() {
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [0, 2, 1, 3],
            [1, 0, 3, 2],
            [2, 3, 0, 1],
            [0, 3, 1, 2],
        ];
        for order in orders {
            let jb = buffer();
            // keep frame 0 first so the cursor primes at timestamp 0
            jb.put(tagged(1), 0, 0).unwrap();
            for &idx in order.iter().filter(|&&i| i != 0) {
                jb.put(tagged(idx as i16 + 1), (idx * FRAME) as u32, idx as u16)
                    .unwrap();
            }

            let out = jb.get(4 * FRAME);
            assert_eq!(tags_of(&out), vec![1, 2, 3, 4], "order {:?}", order);
            assert_eq!(jb.stats().underruns, 0, "order {:?}", order);
        }
    }

    #[test]
    fn test_duplicate_does_not_grow_buffer() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(1), 0, 0).unwrap();

        let stats = jb.stats();
        assert_eq!(stats.buffered_frames, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_late_packet_dropped_and_never_played() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();

        // Play far past the delay window
        for _ in 0..10 {
            jb.get(FRAME);
        }

        jb.put(tagged(9), 0, 0).unwrap();
        assert_eq!(jb.stats().late_drops, 1);
        assert_eq!(jb.stats().buffered_frames, 0);

        let out = jb.get(FRAME);
        assert!(out.data().iter().all(|&s| s != 9));
    }

    #[test]
    fn test_gap_substituted_with_silence() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(3), 640, 2).unwrap();

        let out = jb.get(960);
        assert_eq!(out.len(), 960);
        assert_eq!(tags_of(&out), vec![1, 0, 3]);
        assert_eq!(jb.stats().underruns, 1);
    }

    #[test]
    fn test_starvation_still_returns_exact_length() {
        let jb = buffer();
        for &len in &[FRAME, 2 * FRAME, 5 * FRAME] {
            let out = jb.get(len);
            assert_eq!(out.len(), len);
            assert!(out.data().iter().all(|&s| s == 0));
        }
        assert!(jb.stats().underruns > 0);
    }

    #[test]
    fn test_partial_reads_do_not_overlap() {
        let jb = buffer();
        jb.put(
            Pcm::new((0..FRAME as i16).collect()),
            0,
            0,
        )
        .unwrap();
        jb.put(
            Pcm::new((FRAME as i16..2 * FRAME as i16).collect()),
            320,
            1,
        )
        .unwrap();

        let first = jb.get(100);
        let second = jb.get(2 * FRAME - 100);
        let mut all = first.into_inner();
        all.extend(second.into_inner());

        let expected: Vec<i16> = (0..2 * FRAME as i16).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_sequence_and_timestamp_wraparound() {
        let jb = buffer();
        let base = u32::MAX - (FRAME as u32) + 1; // last frame before wrap

        jb.put(tagged(1), base, u16::MAX).unwrap();
        jb.put(tagged(2), 0, 0).unwrap(); // wrapped
        jb.put(tagged(3), FRAME as u32, 1).unwrap();

        let out = jb.get(3 * FRAME);
        assert_eq!(tags_of(&out), vec![1, 2, 3]);

        let stats = jb.stats();
        assert_eq!(stats.late_drops, 0);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.underruns, 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let jb = JitterBuffer::<8000>::new(JitterConfig {
            frame_size: FRAME,
            capacity: 3,
            max_delay_ms: 1000,
            ..JitterConfig::default()
        })
        .unwrap();

        for i in 0..4u16 {
            jb.put(tagged(i as i16 + 1), i as u32 * FRAME as u32, i).unwrap();
        }

        let stats = jb.stats();
        assert_eq!(stats.buffered_frames, 3);
        assert_eq!(stats.discarded, 1);

        // oldest (tag 1) is gone, newest (tag 4) survives
        let out = jb.get(4 * FRAME);
        assert_eq!(tags_of(&out), vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_delay_adapts_within_bounds() {
        let jb = buffer();
        let initial = jb.delay_ms();

        // timestamp steps wildly out of line with the sequence cadence
        let mut ts = 0u32;
        for i in 0..40u16 {
            jb.put(tagged(1), ts, i).ok();
            ts = ts.wrapping_add(if i % 2 == 0 { FRAME as u32 * 4 } else { FRAME as u32 });
        }
        let stressed = jb.delay_ms();
        assert!(stressed > initial, "delay should grow under jitter");
        assert!(stressed <= jb.config().max_delay_ms as f32);

        // steady cadence pulls it back down toward the minimum
        let jb2 = buffer();
        for i in 0..200u16 {
            jb2.put(tagged(1), i as u32 * FRAME as u32, i).unwrap();
            jb2.get(FRAME);
        }
        let settled = jb2.delay_ms();
        assert!(settled < initial, "steady arrivals should shrink the delay");
        assert!(settled >= jb2.config().min_delay_ms as f32);
    }

    #[test]
    fn test_stats_snapshot_idempotent() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.get(FRAME);

        let first = jb.stats();
        let second = jb.stats();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.get(FRAME * 3);

        jb.reset();

        let stats = jb.stats();
        assert_eq!(stats, JitterStats {
            current_delay_ms: jb.config().initial_delay_ms as f32,
            ..JitterStats::default()
        });
        assert_eq!(jb.delay_ms(), jb.config().initial_delay_ms as f32);
    }

    #[test]
    fn test_advisory_loss_from_sequence_gaps() {
        let jb = buffer();
        jb.put(tagged(1), 0, 0).unwrap();
        jb.put(tagged(2), 320, 1).unwrap();
        // sequence 2 lost in the network
        jb.put(tagged(4), 960, 3).unwrap();

        assert_eq!(jb.stats().packets_lost, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let jb = buffer();
        assert!(jb.put(Pcm::silence(100), 0, 0).is_err());
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        assert!(JitterBuffer::<8000>::new(JitterConfig {
            frame_size: 0,
            ..JitterConfig::default()
        })
        .is_err());
        assert!(JitterBuffer::<8000>::new(JitterConfig {
            min_delay_ms: 300,
            max_delay_ms: 100,
            ..JitterConfig::default()
        })
        .is_err());
        assert!(JitterBuffer::<8000>::new(JitterConfig {
            initial_delay_ms: 500,
            ..JitterConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_extend_helpers() {
        assert_eq!(extend_u32(100, 150), 150);
        assert_eq!(extend_u32(u32::MAX as u64, 5), (1u64 << 32) + 5);
        assert_eq!(extend_u32((1u64 << 32) + 5, u32::MAX), u32::MAX as u64);
        assert_eq!(extend_u16(65535, 2), 65538);
        assert_eq!(extend_u16(65538, 65535), 65535);
    }
}
