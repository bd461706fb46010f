//! Low-frequency oscillator
//!
//! Free-running (Hz) or tempo-synced (musical divisions including dotted
//! and triplet variants). The generator only produces a value in roughly
//! [-1, 1]; routing to a destination and scaling by depth is the voice's
//! job.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LfoWaveform {
    Sine,
    Triangle,
    Square,
    /// Ramp up
    SawUp,
    /// Ramp down
    SawDown,
    /// Stepped random values, updated on phase wrap
    RandomStep,
    /// Linear interpolation between random values
    RandomSmooth,
}

/// Musical note length for tempo-synced LFOs, relative to a quarter-note
/// beat: a Whole note is 4 beats, dotted adds 50%, triplets are 2/3 of the
/// base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDivision {
    Whole,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
    SixtyFourth,
    DottedHalf,
    DottedQuarter,
    DottedEighth,
    DottedSixteenth,
    TripletWhole,
    TripletHalf,
    TripletQuarter,
    TripletEighth,
    TripletSixteenth,
    None,
}

impl TimeDivision {
    /// Length in beats (quarter notes), or `None` for the unsynced marker.
    fn beats(self) -> Option<f64> {
        let beats = match self {
            TimeDivision::Whole => 4.0,
            TimeDivision::Half => 2.0,
            TimeDivision::Quarter => 1.0,
            TimeDivision::Eighth => 0.5,
            TimeDivision::Sixteenth => 0.25,
            TimeDivision::ThirtySecond => 0.125,
            TimeDivision::SixtyFourth => 0.0625,
            TimeDivision::DottedHalf => 2.0 * 1.5,
            TimeDivision::DottedQuarter => 1.0 * 1.5,
            TimeDivision::DottedEighth => 0.5 * 1.5,
            TimeDivision::DottedSixteenth => 0.25 * 1.5,
            TimeDivision::TripletWhole => 4.0 * 2.0 / 3.0,
            TimeDivision::TripletHalf => 2.0 * 2.0 / 3.0,
            TimeDivision::TripletQuarter => 1.0 * 2.0 / 3.0,
            TimeDivision::TripletEighth => 0.5 * 2.0 / 3.0,
            TimeDivision::TripletSixteenth => 0.25 * 2.0 / 3.0,
            TimeDivision::None => return None,
        };
        Some(beats)
    }
}

/// Modulation target the owning voice routes the LFO output to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LfoDestination {
    None,
    Pitch,
    Pan,
    Volume,
    FilterCutoff,
    FilterResonance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfoSettings {
    pub enabled: bool,
    pub waveform: LfoWaveform,
    pub rate_hz: f32,
    pub sync_to_tempo: bool,
    pub tempo_division: TimeDivision,
    /// 0.0 to 1.0
    pub depth: f32,
    pub destination: LfoDestination,
}

impl Default for LfoSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            waveform: LfoWaveform::Sine,
            rate_hz: 1.0,
            sync_to_tempo: false,
            tempo_division: TimeDivision::Quarter,
            depth: 0.5,
            destination: LfoDestination::None,
        }
    }
}

pub struct LfoGenerator {
    settings: LfoSettings,
    sample_rate: f32,
    tempo_bpm: f32,
    phase: f64,
    phase_increment: f64,
    last_random: f32,
    next_random: f32,
    rng: SmallRng,
}

impl Default for LfoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl LfoGenerator {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Deterministic construction from a seed. Voice allocators derive
    /// seeds from their own generator so triggering stays off the OS
    /// entropy path.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            settings: LfoSettings::default(),
            sample_rate: 48000.0,
            tempo_bpm: 120.0,
            phase: 0.0,
            phase_increment: 0.0,
            last_random: 0.0,
            next_random: 0.0,
            rng,
        }
    }

    /// Installs settings, sample rate and current tempo, resetting the
    /// phase and recomputing the increment.
    pub fn configure(&mut self, settings: LfoSettings, sample_rate: f32, tempo_bpm: f32) {
        self.settings = settings;
        self.sample_rate = if sample_rate > 0.0 { sample_rate } else { 48000.0 };
        self.tempo_bpm = if tempo_bpm > 0.0 { tempo_bpm } else { 120.0 };
        self.phase = 0.0;
        self.calculate_phase_increment();

        if self.is_random_waveform() {
            self.last_random = self.rng.gen_range(-1.0..=1.0);
            self.next_random = self.rng.gen_range(-1.0..=1.0);
        }
    }

    /// Tempo change for synced LFOs; free-running LFOs are unaffected.
    pub fn set_tempo(&mut self, tempo_bpm: f32) {
        if tempo_bpm > 0.0 {
            self.tempo_bpm = tempo_bpm;
            if self.settings.sync_to_tempo {
                self.calculate_phase_increment();
            }
        }
    }

    fn is_random_waveform(&self) -> bool {
        matches!(
            self.settings.waveform,
            LfoWaveform::RandomStep | LfoWaveform::RandomSmooth
        )
    }

    fn calculate_phase_increment(&mut self) {
        if self.settings.sync_to_tempo {
            let beats = self.settings.tempo_division.beats();
            match beats {
                Some(beats) if self.tempo_bpm > 0.0 && self.sample_rate > 0.0 => {
                    let beats_per_second = self.tempo_bpm as f64 / 60.0;
                    let cycle_seconds = beats / beats_per_second;
                    if cycle_seconds > 1e-5 {
                        self.phase_increment = 1.0 / (cycle_seconds * self.sample_rate as f64);
                    } else {
                        self.phase_increment = 0.0;
                    }
                }
                _ => self.phase_increment = 0.0,
            }
        } else if self.sample_rate > 0.0 {
            self.phase_increment = self.settings.rate_hz as f64 / self.sample_rate as f64;
        } else {
            self.phase_increment = 0.0;
        }
    }

    pub fn reset_phase(&mut self) {
        self.phase = 0.0;
        if self.is_random_waveform() {
            self.last_random = self.rng.gen_range(-1.0..=1.0);
            self.next_random = self.rng.gen_range(-1.0..=1.0);
        }
    }

    pub fn retrigger(&mut self) {
        self.reset_phase();
    }

    /// Advances one sample and returns the LFO value in [-1, 1].
    pub fn process(&mut self) -> f32 {
        let phase = self.phase as f32;
        let value = match self.settings.waveform {
            LfoWaveform::Sine => (phase * 2.0 * std::f32::consts::PI).sin(),
            LfoWaveform::Triangle => {
                // Piecewise linear through (0,0) (0.25,1) (0.75,-1) (1,0)
                if phase < 0.25 {
                    phase * 4.0
                } else if phase < 0.75 {
                    1.0 - (phase - 0.25) * 4.0
                } else {
                    -1.0 + (phase - 0.75) * 4.0
                }
            }
            LfoWaveform::Square => {
                if phase < 0.5 { 1.0 } else { -1.0 }
            }
            LfoWaveform::SawUp => phase * 2.0 - 1.0,
            LfoWaveform::SawDown => 1.0 - phase * 2.0,
            LfoWaveform::RandomStep => self.last_random,
            LfoWaveform::RandomSmooth => {
                self.last_random + (self.next_random - self.last_random) * phase
            }
        };

        self.phase += self.phase_increment;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
            if self.is_random_waveform() {
                self.last_random = self.next_random;
                self.next_random = self.rng.gen_range(-1.0..=1.0);
            }
        }
        value
    }

    pub fn settings(&self) -> &LfoSettings {
        &self.settings
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(waveform: LfoWaveform, rate_hz: f32) -> LfoGenerator {
        let mut lfo = LfoGenerator::new();
        lfo.configure(
            LfoSettings {
                enabled: true,
                waveform,
                rate_hz,
                ..LfoSettings::default()
            },
            48000.0,
            120.0,
        );
        lfo
    }

    #[test]
    fn test_output_range_all_waveforms() {
        let waveforms = [
            LfoWaveform::Sine,
            LfoWaveform::Triangle,
            LfoWaveform::Square,
            LfoWaveform::SawUp,
            LfoWaveform::SawDown,
            LfoWaveform::RandomStep,
            LfoWaveform::RandomSmooth,
        ];
        for waveform in waveforms {
            let mut lfo = configured(waveform, 7.3);
            for _ in 0..50000 {
                let v = lfo.process();
                assert!((-1.0..=1.0).contains(&v), "{waveform:?} out of range: {v}");
                assert!(lfo.phase() >= 0.0 && lfo.phase() < 1.0);
            }
        }
    }

    #[test]
    fn test_sine_period() {
        // At 1 Hz and 48 kHz, one cycle is exactly 48000 samples
        let mut lfo = configured(LfoWaveform::Sine, 1.0);
        let first = lfo.process();
        for _ in 0..47999 {
            lfo.process();
        }
        let wrapped = lfo.process();
        assert!((first - wrapped).abs() < 1e-4);
    }

    #[test]
    fn test_triangle_breakpoints() {
        let mut lfo = configured(LfoWaveform::Triangle, 1.0);
        // phase 0 -> 0
        assert!(lfo.process().abs() < 1e-6);
        // advance to phase 0.25 -> 1
        for _ in 0..12000 - 1 {
            lfo.process();
        }
        assert!((lfo.process() - 1.0).abs() < 1e-3);
        // advance to phase 0.75 -> -1
        for _ in 0..24000 - 1 {
            lfo.process();
        }
        assert!((lfo.process() + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_tempo_sync_quarter_at_120() {
        // A quarter note at 120 BPM is 0.5 s, so one cycle is 24000 samples
        let mut lfo = LfoGenerator::new();
        lfo.configure(
            LfoSettings {
                enabled: true,
                waveform: LfoWaveform::SawUp,
                sync_to_tempo: true,
                tempo_division: TimeDivision::Quarter,
                ..LfoSettings::default()
            },
            48000.0,
            120.0,
        );
        for _ in 0..12000 {
            lfo.process();
        }
        // Half a cycle in: saw-up should be near 0
        let mid = lfo.process();
        assert!(mid.abs() < 0.01, "expected mid-cycle value near 0, got {mid}");
    }

    #[test]
    fn test_dotted_and_triplet_scaling() {
        assert_eq!(TimeDivision::DottedQuarter.beats(), Some(1.5));
        let triplet = TimeDivision::TripletQuarter.beats().unwrap();
        assert!((triplet - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(TimeDivision::None.beats(), None);
    }

    #[test]
    fn test_random_step_holds_until_wrap() {
        let mut lfo = configured(LfoWaveform::RandomStep, 100.0);
        // 100 Hz at 48 kHz wraps every 480 samples
        let first = lfo.process();
        for _ in 0..400 {
            assert_eq!(lfo.process(), first);
        }
    }

    #[test]
    fn test_random_smooth_interpolates() {
        let mut lfo = configured(LfoWaveform::RandomSmooth, 10.0);
        let mut previous = lfo.process();
        // Within one cycle, consecutive values move by at most the slope of
        // a single linear segment
        let max_step = 2.0 / (48000.0 / 10.0) * 1.5;
        for _ in 0..2000 {
            let v = lfo.process();
            let delta = (v - previous).abs();
            // Allow the jump at the cycle wrap
            if delta > max_step {
                assert!(delta <= 2.0);
            }
            previous = v;
        }
    }

    #[test]
    fn test_retrigger_resets_phase() {
        let mut lfo = configured(LfoWaveform::SawUp, 3.0);
        for _ in 0..1000 {
            lfo.process();
        }
        lfo.retrigger();
        assert_eq!(lfo.phase(), 0.0);
        assert!((lfo.process() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_set_tempo_updates_synced_increment() {
        let mut lfo = LfoGenerator::new();
        lfo.configure(
            LfoSettings {
                enabled: true,
                waveform: LfoWaveform::Square,
                sync_to_tempo: true,
                tempo_division: TimeDivision::Quarter,
                ..LfoSettings::default()
            },
            48000.0,
            120.0,
        );
        let before = {
            lfo.process();
            lfo.phase()
        };
        lfo.reset_phase();
        lfo.set_tempo(240.0);
        lfo.process();
        let after = lfo.phase();
        assert!((after - before * 2.0).abs() < 1e-12);
    }
}
