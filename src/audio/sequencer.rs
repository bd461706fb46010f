//! Sample-accurate step trigger scheduling
//!
//! The control side enqueues pad triggers with microsecond timestamps on
//! the engine's monotonic clock; the audio callback fires every due
//! trigger at the start of its block, in timestamp order. Triggers that
//! sat unprocessed for more than 100 ms are counted as missed and dropped.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::samples::PAD_COUNT;
use crate::error::{EngineError, Result};

/// Unprocessed triggers older than this are missed.
const STALE_TRIGGER_US: i64 = 100_000;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

#[derive(Debug, Clone, Copy)]
struct ScheduledTrigger {
    pad_index: usize,
    velocity: f32,
    timestamp_us: i64,
}

/// Timing statistics exposed to the control side.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TimingStatistics {
    pub total_triggers: u64,
    pub missed_triggers: u64,
    pub scheduled_count: usize,
    pub avg_latency_us: f64,
    pub max_latency_us: i64,
    pub min_latency_us: i64,
    pub jitter_us: i64,
    pub buffer_underruns: u64,
}

#[derive(Default)]
struct PerformanceCounters {
    total_triggers: AtomicU64,
    missed_triggers: AtomicU64,
    total_latency_us: AtomicI64,
    max_latency_us: AtomicI64,
    min_latency_us: AtomicI64,
    buffer_underruns: AtomicU64,
}

pub struct StepScheduler {
    triggers: Mutex<Vec<ScheduledTrigger>>,
    counters: PerformanceCounters,
    tempo_bpm_bits: AtomicU32,
}

impl Default for StepScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl StepScheduler {
    pub fn new() -> Self {
        let counters = PerformanceCounters::default();
        counters.min_latency_us.store(i64::MAX, Ordering::Relaxed);
        Self {
            triggers: Mutex::new(Vec::with_capacity(256)),
            counters,
            tempo_bpm_bits: AtomicU32::new(f32_to_u32(120.0)),
        }
    }

    /// Enqueues a pad trigger. The queue is kept sorted by timestamp so
    /// the render thread fires in order with a single pass.
    pub fn schedule_step_trigger(
        &self,
        pad_index: usize,
        velocity: f32,
        timestamp_us: i64,
    ) -> Result<()> {
        if pad_index >= PAD_COUNT {
            return Err(EngineError::InvalidArgument(format!("invalid pad index: {pad_index}")));
        }
        if !(0.0..=1.0).contains(&velocity) {
            return Err(EngineError::InvalidArgument(format!("invalid velocity: {velocity}")));
        }

        let trigger = ScheduledTrigger { pad_index, velocity, timestamp_us };
        let mut triggers = self.triggers.lock();
        let at = triggers.partition_point(|t| t.timestamp_us <= timestamp_us);
        triggers.insert(at, trigger);
        log::debug!("scheduled trigger: pad={pad_index}, velocity={velocity}, t={timestamp_us}");
        Ok(())
    }

    pub fn clear(&self) {
        self.triggers.lock().clear();
        log::debug!("cleared all scheduled triggers");
    }

    /// Sequencer tempo in BPM, clamped to [60, 200].
    pub fn set_tempo(&self, bpm: f32) {
        let clamped = bpm.clamp(60.0, 200.0);
        if clamped != bpm {
            log::warn!("tempo out of range: {bpm} BPM");
        }
        self.tempo_bpm_bits.store(f32_to_u32(clamped), Ordering::Relaxed);
    }

    pub fn tempo(&self) -> f32 {
        u32_to_f32(self.tempo_bpm_bits.load(Ordering::Relaxed))
    }

    /// Fires every due trigger through `fire`, in timestamp order, and
    /// drops stale ones. Called by the audio callback with a single clock
    /// read per block.
    pub fn process_due(&self, now_us: i64, mut fire: impl FnMut(usize, f32)) {
        let mut triggers = self.triggers.lock();
        if triggers.is_empty() {
            return;
        }

        // Sorted by timestamp: everything due sits at the front
        let due = triggers.partition_point(|t| t.timestamp_us <= now_us);
        for trigger in triggers.drain(..due) {
            let age = now_us - trigger.timestamp_us;
            if age > STALE_TRIGGER_US {
                self.counters.missed_triggers.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "missed trigger for pad {} (age {age} us)",
                    trigger.pad_index
                );
                continue;
            }

            fire(trigger.pad_index, trigger.velocity);

            self.counters.total_triggers.fetch_add(1, Ordering::Relaxed);
            self.counters.total_latency_us.fetch_add(age, Ordering::Relaxed);
            self.counters.max_latency_us.fetch_max(age, Ordering::Relaxed);
            self.counters.min_latency_us.fetch_min(age, Ordering::Relaxed);
        }
    }

    pub fn note_buffer_underrun(&self) {
        self.counters.buffer_underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> TimingStatistics {
        let total = self.counters.total_triggers.load(Ordering::Relaxed);
        let max = self.counters.max_latency_us.load(Ordering::Relaxed);
        let min_raw = self.counters.min_latency_us.load(Ordering::Relaxed);
        let min = if min_raw == i64::MAX { 0 } else { min_raw };
        TimingStatistics {
            total_triggers: total,
            missed_triggers: self.counters.missed_triggers.load(Ordering::Relaxed),
            scheduled_count: self.triggers.lock().len(),
            avg_latency_us: if total > 0 {
                self.counters.total_latency_us.load(Ordering::Relaxed) as f64 / total as f64
            } else {
                0.0
            },
            max_latency_us: max,
            min_latency_us: min,
            jitter_us: max - min,
            buffer_underruns: self.counters.buffer_underruns.load(Ordering::Relaxed),
        }
    }
}
