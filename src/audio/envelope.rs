//! Multi-stage envelope generator
//!
//! Supports AD, AHDS and ADSR shapes with per-sample linear rates.
//! Velocity can shorten the attack; the release rate is always recomputed
//! from the value at the moment of trigger-off so a release started
//! mid-attack still reaches zero in the configured release time.

use serde::{Deserialize, Serialize};

/// Envelope shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// Attack, decay to zero
    Ad,
    /// Attack, hold, decay, sustain (instant release)
    Ahds,
    /// Attack, decay, sustain, release
    Adsr,
}

/// Current stage of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
}

/// Envelope configuration. Value semantics; copied into each envelope at
/// trigger time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSettings {
    pub envelope_type: EnvelopeType,
    pub attack_ms: f32,
    pub hold_ms: f32,
    pub decay_ms: f32,
    /// 0.0 to 1.0
    pub sustain_level: f32,
    pub release_ms: f32,
    /// 1.0 means max velocity makes the attack instant
    pub velocity_to_attack: f32,
    /// 1.0 means velocity fully scales output level (applied by the voice)
    pub velocity_to_level: f32,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self {
            envelope_type: EnvelopeType::Adsr,
            attack_ms: 5.0,
            hold_ms: 0.0,
            decay_ms: 150.0,
            sustain_level: 1.0,
            release_ms: 100.0,
            velocity_to_attack: 0.0,
            velocity_to_level: 0.0,
        }
    }
}

pub struct EnvelopeGenerator {
    settings: EnvelopeSettings,
    sample_rate: f32,
    current_value: f32,
    stage: EnvelopeStage,
    attack_rate: f32,
    decay_rate: f32,
    release_rate: f32,
    hold_time_samples: f32,
    hold_samples_remaining: f32,
}

impl Default for EnvelopeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeGenerator {
    pub fn new() -> Self {
        Self {
            settings: EnvelopeSettings::default(),
            sample_rate: 44100.0,
            current_value: 0.0,
            stage: EnvelopeStage::Idle,
            attack_rate: 0.0,
            decay_rate: 0.0,
            release_rate: 0.0,
            hold_time_samples: 0.0,
            hold_samples_remaining: 0.0,
        }
    }

    /// Installs settings and recomputes rates. Non-positive sample rates
    /// fall back to 44100.
    pub fn configure(&mut self, settings: EnvelopeSettings, sample_rate: f32, trigger_velocity: f32) {
        self.settings = settings;
        self.sample_rate = if sample_rate > 0.0 { sample_rate } else { 44100.0 };
        self.reset();
        self.calculate_rates(trigger_velocity);
    }

    fn calculate_rates(&mut self, trigger_velocity: f32) {
        // Higher velocity shortens the attack when velocity_to_attack is set
        let mut actual_attack_ms = self.settings.attack_ms;
        if self.settings.velocity_to_attack > 0.0 {
            actual_attack_ms =
                self.settings.attack_ms * (1.0 - trigger_velocity * self.settings.velocity_to_attack);
            actual_attack_ms = actual_attack_ms.max(0.0);
        }

        self.attack_rate = if actual_attack_ms > 0.0 {
            1.0 / (actual_attack_ms / 1000.0 * self.sample_rate)
        } else {
            1.0
        };

        // AD decays all the way to zero; the sustaining shapes decay to the
        // sustain level.
        let decay_target = match self.settings.envelope_type {
            EnvelopeType::Ad => 0.0,
            _ => self.settings.sustain_level,
        };
        self.decay_rate = if self.settings.decay_ms > 0.0 {
            (1.0 - decay_target) / (self.settings.decay_ms / 1000.0 * self.sample_rate)
        } else {
            1.0
        };

        self.release_rate = if self.settings.release_ms > 0.0 {
            let release_from = match self.settings.envelope_type {
                EnvelopeType::Ad => self.current_value,
                _ => self.settings.sustain_level,
            };
            if release_from > 0.0 {
                release_from / (self.settings.release_ms / 1000.0 * self.sample_rate)
            } else {
                1.0
            }
        } else {
            1.0
        };

        self.hold_time_samples = if self.settings.hold_ms > 0.0 {
            self.settings.hold_ms / 1000.0 * self.sample_rate
        } else {
            0.0
        };
    }

    /// Resets the value to zero and enters Attack, skipping ahead when the
    /// attack time is zero. Rates are recomputed for this trigger's velocity.
    pub fn trigger_on(&mut self, trigger_velocity: f32) {
        self.calculate_rates(trigger_velocity);

        self.current_value = 0.0;
        self.stage = EnvelopeStage::Attack;
        self.hold_samples_remaining = self.hold_time_samples;

        if self.settings.attack_ms <= 0.0 {
            self.current_value = 1.0;
            self.stage = match self.settings.envelope_type {
                EnvelopeType::Ad => EnvelopeStage::Decay,
                EnvelopeType::Ahds | EnvelopeType::Adsr => {
                    if self.hold_time_samples > 0.0 {
                        EnvelopeStage::Hold
                    } else {
                        EnvelopeStage::Decay
                    }
                }
            };
        }
    }

    /// Moves to Release, recomputing the release rate from the current
    /// value so the configured release time holds from wherever we are.
    pub fn trigger_off(&mut self) {
        if self.stage == EnvelopeStage::Idle {
            return;
        }
        self.stage = EnvelopeStage::Release;
        self.release_rate = if self.settings.release_ms > 0.0 {
            if self.current_value > 0.0 {
                self.current_value / (self.settings.release_ms / 1000.0 * self.sample_rate)
            } else {
                1.0
            }
        } else {
            1.0
        };
    }

    /// Advances by one sample. Returns the envelope value in [0, 1].
    pub fn process(&mut self) -> f32 {
        match self.stage {
            EnvelopeStage::Idle => {
                self.current_value = 0.0;
            }
            EnvelopeStage::Attack => {
                self.current_value += self.attack_rate;
                if self.current_value >= 1.0 {
                    self.current_value = 1.0;
                    let wants_hold = matches!(self.settings.envelope_type, EnvelopeType::Ahds)
                        || (matches!(self.settings.envelope_type, EnvelopeType::Adsr)
                            && self.settings.hold_ms > 0.0);
                    if wants_hold && self.hold_time_samples > 0.0 {
                        self.stage = EnvelopeStage::Hold;
                        self.hold_samples_remaining = self.hold_time_samples;
                    } else {
                        self.stage = EnvelopeStage::Decay;
                    }
                }
            }
            EnvelopeStage::Hold => {
                self.current_value = 1.0;
                self.hold_samples_remaining -= 1.0;
                if self.hold_samples_remaining <= 0.0 {
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                self.current_value -= self.decay_rate;
                match self.settings.envelope_type {
                    EnvelopeType::Ad => {
                        if self.current_value <= 0.0 {
                            self.current_value = 0.0;
                            self.stage = EnvelopeStage::Idle;
                        }
                    }
                    _ => {
                        if self.current_value <= self.settings.sustain_level {
                            self.current_value = self.settings.sustain_level;
                            self.stage = EnvelopeStage::Sustain;
                        }
                    }
                }
            }
            EnvelopeStage::Sustain => {
                self.current_value = self.settings.sustain_level;
                if self.settings.sustain_level <= 0.0 {
                    self.stage = EnvelopeStage::Idle;
                    self.current_value = 0.0;
                }
            }
            EnvelopeStage::Release => {
                self.current_value -= self.release_rate;
                if self.current_value <= 0.0 {
                    self.current_value = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
            }
        }
        self.current_value
    }

    pub fn reset(&mut self) {
        self.current_value = 0.0;
        self.stage = EnvelopeStage::Idle;
        self.hold_samples_remaining = 0.0;
    }

    pub fn is_active(&self) -> bool {
        self.stage != EnvelopeStage::Idle
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn value(&self) -> f32 {
        self.current_value
    }

    pub fn settings(&self) -> &EnvelopeSettings {
        &self.settings
    }
}
