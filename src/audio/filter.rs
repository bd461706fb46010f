//! State-variable filter
//!
//! Two-integrator topology with bilinear pre-warping of the cutoff,
//! producing simultaneous low-, band- and high-pass outputs from two
//! integrator states. The per-sample update order is load-bearing.

use serde::{Deserialize, Serialize};

/// Filter response selected from the SVF outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    LowPass,
    BandPass,
    HighPass,
}

/// Per-pad filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    pub enabled: bool,
    pub mode: FilterMode,
    pub cutoff_hz: f32,
    /// Q factor
    pub resonance: f32,
    /// Octaves of cutoff modulation contributed by the filter envelope
    pub env_amount: f32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: FilterMode::LowPass,
            cutoff_hz: 18000.0,
            resonance: 0.707,
            env_amount: 0.0,
        }
    }
}

/// Integrator state magnitudes below this are flushed to zero.
const DENORMAL_FLOOR: f32 = 1e-20;

pub struct StateVariableFilter {
    sample_rate: f32,
    mode: FilterMode,
    g: f32,
    r2: f32,
    h: f32,
    s1: f32,
    s2: f32,
}

impl Default for StateVariableFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl StateVariableFilter {
    pub fn new() -> Self {
        let mut filter = Self {
            sample_rate: 48000.0,
            mode: FilterMode::LowPass,
            g: 0.0,
            r2: 0.0,
            h: 0.0,
            s1: 0.0,
            s2: 0.0,
        };
        filter.calculate_coefficients(18000.0, 0.707);
        filter
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        if sample_rate > 0.0 {
            self.sample_rate = sample_rate;
        }
    }

    /// Installs mode, cutoff and resonance, clamping cutoff to
    /// [20, sample_rate/2 - 100] and Q to [0.5, 25].
    pub fn configure(&mut self, mode: FilterMode, cutoff_hz: f32, resonance_q: f32) {
        self.mode = mode;

        let nyquist_margin = self.sample_rate / 2.0 - 100.0;
        let cutoff = cutoff_hz.clamp(20.0, nyquist_margin.max(20.0));
        let q = resonance_q.clamp(0.5, 25.0);

        self.calculate_coefficients(cutoff, q);
    }

    fn calculate_coefficients(&mut self, cutoff_hz: f32, resonance_q: f32) {
        if self.sample_rate <= 0.0 {
            return;
        }

        // Bilinear transform pre-warping of the cutoff frequency
        let wd = 2.0 * std::f32::consts::PI * cutoff_hz;
        let t = 1.0 / self.sample_rate;
        let wa = (2.0 / t) * (wd * t / 2.0).tan();

        self.g = wa * t / 2.0;
        self.r2 = 1.0 / (2.0 * resonance_q.max(0.01));
        self.h = 1.0 / (1.0 + 2.0 * self.r2 * self.g + self.g * self.g);
    }

    /// Processes one sample, returning the output for the configured mode.
    pub fn process(&mut self, input: f32) -> f32 {
        let y_hp = self.h * (input - (2.0 * self.r2 + self.g) * self.s1 - self.s2);
        let y_bp = self.g * y_hp + self.s1;
        self.s1 = y_bp + self.g * y_hp;
        let y_lp = self.g * y_bp + self.s2;
        self.s2 = y_lp + self.g * y_bp;

        if self.s1.abs() < DENORMAL_FLOOR {
            self.s1 = 0.0;
        }
        if self.s2.abs() < DENORMAL_FLOOR {
            self.s2 = 0.0;
        }

        match self.mode {
            FilterMode::LowPass => y_lp,
            FilterMode::BandPass => y_bp,
            FilterMode::HighPass => y_hp,
        }
    }

    pub fn reset(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_input_after_reset_is_silent() {
        let mut filter = StateVariableFilter::new();
        filter.set_sample_rate(48000.0);
        filter.configure(FilterMode::LowPass, 1000.0, 5.0);
        // Drive it, then reset
        for _ in 0..100 {
            filter.process(1.0);
        }
        filter.reset();
        for _ in 0..100 {
            assert_eq!(filter.process(0.0), 0.0);
        }
    }

    #[test]
    fn test_bounded_output_for_bounded_input() {
        let modes = [FilterMode::LowPass, FilterMode::BandPass, FilterMode::HighPass];
        let cutoffs = [20.0, 200.0, 2000.0, 18000.0];
        let qs = [0.5, 5.0, 25.0];
        for mode in modes {
            for &cutoff in &cutoffs {
                for &q in &qs {
                    let mut filter = StateVariableFilter::new();
                    filter.set_sample_rate(48000.0);
                    filter.configure(mode, cutoff, q);
                    // Worst-case square-ish excitation
                    for i in 0..20000 {
                        let x = if (i / 37) % 2 == 0 { 1.0 } else { -1.0 };
                        let y = filter.process(x);
                        assert!(
                            y.abs() < 50.0,
                            "{mode:?} cutoff={cutoff} q={q}: output {y} unbounded"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let mut filter = StateVariableFilter::new();
        filter.set_sample_rate(48000.0);
        filter.configure(FilterMode::LowPass, 1000.0, 0.707);
        let mut last = 0.0;
        for _ in 0..48000 {
            last = filter.process(1.0);
        }
        assert!((last - 1.0).abs() < 1e-3, "LP should settle at DC input: {last}");
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut filter = StateVariableFilter::new();
        filter.set_sample_rate(48000.0);
        filter.configure(FilterMode::HighPass, 1000.0, 0.707);
        let mut last = 1.0;
        for _ in 0..48000 {
            last = filter.process(1.0);
        }
        assert!(last.abs() < 1e-3, "HP should reject DC: {last}");
    }

    #[test]
    fn test_cutoff_clamped_to_nyquist_margin() {
        let mut filter = StateVariableFilter::new();
        filter.set_sample_rate(48000.0);
        // Far beyond Nyquist; must not produce NaNs
        filter.configure(FilterMode::LowPass, 1e9, 0.707);
        for _ in 0..100 {
            let y = filter.process(1.0);
            assert!(y.is_finite());
        }
    }
}
