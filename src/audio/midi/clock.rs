//! External clock synchronisation
//!
//! An external musical clock sends 24 pulses per quarter note. Pulse
//! intervals feed a small ring; the derived BPM is smoothed with an
//! exponential moving average and declared stable once the coefficient of
//! variation of the recent intervals drops below 5%.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Pulses per quarter note sent by external clocks.
const PULSES_PER_QUARTER: f32 = 24.0;

/// Ring size for stability analysis.
const MAX_RECENT_INTERVALS: usize = 24;

/// Minimum intervals before stability can be declared.
const MIN_INTERVALS_FOR_STABILITY: usize = 8;

/// Intervals outside this window are ignored as unrealistic.
const MIN_INTERVAL_US: i64 = 1_000;
const MAX_INTERVAL_US: i64 = 2_000_000;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

#[derive(Debug)]
struct ClockTiming {
    last_pulse_time_us: i64,
    recent_intervals: Vec<i64>,
    detected_bpm: f32,
    pulse_count: u64,
    is_stable: bool,
}

impl ClockTiming {
    fn new() -> Self {
        Self {
            last_pulse_time_us: 0,
            recent_intervals: Vec::with_capacity(MAX_RECENT_INTERVALS),
            detected_bpm: 120.0,
            pulse_count: 0,
            is_stable: false,
        }
    }

    fn reset(&mut self) {
        self.last_pulse_time_us = 0;
        self.recent_intervals.clear();
        self.detected_bpm = 120.0;
        self.pulse_count = 0;
        self.is_stable = false;
    }

    fn coefficient_of_variation(&self) -> Option<f64> {
        if self.recent_intervals.len() < MIN_INTERVALS_FOR_STABILITY {
            return None;
        }
        let n = self.recent_intervals.len() as f64;
        let mean = self.recent_intervals.iter().sum::<i64>() as f64 / n;
        let variance = self
            .recent_intervals
            .iter()
            .map(|&i| {
                let d = i as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(variance.sqrt() / mean)
    }
}

pub struct ClockSync {
    timing: Mutex<ClockTiming>,
    smoothing_factor_bits: AtomicU32,
    sync_enabled: AtomicBool,
    external_enabled: AtomicBool,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            timing: Mutex::new(ClockTiming::new()),
            smoothing_factor_bits: AtomicU32::new(f32_to_u32(0.1)),
            sync_enabled: AtomicBool::new(false),
            external_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::Relaxed);
        log::info!("clock sync {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::Relaxed)
    }

    pub fn set_external_enabled(&self, enabled: bool) {
        self.external_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.reset();
        }
        log::info!("external clock {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_external_enabled(&self) -> bool {
        self.external_enabled.load(Ordering::Relaxed)
    }

    pub fn set_smoothing_factor(&self, factor: f32) {
        self.smoothing_factor_bits
            .store(f32_to_u32(factor.clamp(0.0, 1.0)), Ordering::Relaxed);
    }

    /// Feeds one clock pulse. Returns the smoothed BPM when the external
    /// clock is enabled and timing is stable, so the caller can follow it.
    pub fn on_pulse(&self, timestamp_us: i64) -> Option<f32> {
        let mut timing = self.timing.lock();

        if timing.last_pulse_time_us == 0 {
            timing.last_pulse_time_us = timestamp_us;
            timing.pulse_count = 1;
            return None;
        }

        let interval = timestamp_us - timing.last_pulse_time_us;
        timing.last_pulse_time_us = timestamp_us;
        timing.pulse_count += 1;

        if !(MIN_INTERVAL_US..=MAX_INTERVAL_US).contains(&interval) {
            log::warn!("ignoring unrealistic clock interval {interval} us");
            return None;
        }

        if timing.recent_intervals.len() >= MAX_RECENT_INTERVALS {
            timing.recent_intervals.remove(0);
        }
        timing.recent_intervals.push(interval);

        let pulse_bpm = bpm_from_interval(interval);
        let factor = u32_to_f32(self.smoothing_factor_bits.load(Ordering::Relaxed));
        timing.detected_bpm = if timing.detected_bpm == 0.0 {
            pulse_bpm
        } else {
            (1.0 - factor) * timing.detected_bpm + factor * pulse_bpm
        };

        timing.is_stable = matches!(timing.coefficient_of_variation(), Some(cv) if cv < 0.05);

        if timing.is_stable && self.external_enabled.load(Ordering::Relaxed) {
            Some(timing.detected_bpm)
        } else {
            None
        }
    }

    pub fn is_stable(&self) -> bool {
        self.timing.lock().is_stable
    }

    pub fn detected_bpm(&self) -> f32 {
        self.timing.lock().detected_bpm
    }

    pub fn pulse_count(&self) -> u64 {
        self.timing.lock().pulse_count
    }

    pub fn reset(&self) {
        self.timing.lock().reset();
        log::debug!("clock timing reset");
    }
}

/// BPM derived from a pulse interval, clamped to [60, 200].
fn bpm_from_interval(interval_us: i64) -> f32 {
    if interval_us <= 0 {
        return 120.0;
    }
    let bpm = 60.0 * 1_000_000.0 / (interval_us as f32 * PULSES_PER_QUARTER);
    bpm.clamp(60.0, 200.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 120 BPM: quarter note every 500 ms, pulse every 500/24 ms
    const INTERVAL_120_BPM: i64 = 20_833;

    #[test]
    fn test_bpm_from_interval() {
        assert!((bpm_from_interval(INTERVAL_120_BPM) - 120.0).abs() < 0.1);
        // Clamped ends
        assert_eq!(bpm_from_interval(1), 200.0);
        assert_eq!(bpm_from_interval(1_000_000), 60.0);
    }

    #[test]
    fn test_periodic_pulses_converge_and_stabilize() {
        let clock = ClockSync::new();
        clock.set_sync_enabled(true);
        clock.set_external_enabled(true);
        clock.set_smoothing_factor(0.5);

        let mut t = 0i64;
        let mut followed = None;
        for _ in 0..24 {
            t += INTERVAL_120_BPM;
            if let Some(bpm) = clock.on_pulse(t) {
                followed = Some(bpm);
            }
        }
        assert!(clock.is_stable());
        let bpm = followed.expect("stable clock should report BPM");
        assert!((bpm - 120.0).abs() < 0.1, "smoothed BPM {bpm}");
    }

    #[test]
    fn test_needs_eight_intervals_for_stability() {
        let clock = ClockSync::new();
        clock.set_external_enabled(true);
        let mut t = 0i64;
        for _ in 0..7 {
            t += INTERVAL_120_BPM;
            clock.on_pulse(t);
        }
        assert!(!clock.is_stable());
    }

    #[test]
    fn test_unrealistic_intervals_ignored() {
        let clock = ClockSync::new();
        clock.set_external_enabled(true);
        let mut t = 0i64;
        for _ in 0..12 {
            t += INTERVAL_120_BPM;
            clock.on_pulse(t);
        }
        assert!(clock.is_stable());
        // A 3-second dropout must not poison the BPM estimate
        t += 3_000_000;
        clock.on_pulse(t);
        assert!((clock.detected_bpm() - 120.0).abs() < 1.0);
    }

    #[test]
    fn test_jittery_clock_is_unstable() {
        let clock = ClockSync::new();
        clock.set_external_enabled(true);
        let mut t = 0i64;
        for i in 0..24 {
            // Alternate between wildly different intervals
            t += if i % 2 == 0 { 10_000 } else { 40_000 };
            clock.on_pulse(t);
        }
        assert!(!clock.is_stable());
    }

    #[test]
    fn test_reset_clears_state() {
        let clock = ClockSync::new();
        clock.set_external_enabled(true);
        let mut t = 0i64;
        for _ in 0..12 {
            t += INTERVAL_120_BPM;
            clock.on_pulse(t);
        }
        clock.reset();
        assert!(!clock.is_stable());
        assert_eq!(clock.pulse_count(), 0);
        assert_eq!(clock.detected_bpm(), 120.0);
    }
}
