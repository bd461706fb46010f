//! Polyphonic subtractive synthesizer
//!
//! Eight voices, each with two selectable-waveform oscillators (PolyBLEP
//! anti-aliased saw and square), a sine sub oscillator one octave down, a
//! noise source, amp and filter envelopes, a state-variable filter and two
//! LFOs. Voice stealing prefers inactive voices, then the oldest releasing
//! voice, then the oldest active one. Retriggering a sounding note reuses
//! its voice without resetting oscillator phases.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{AudioIoConfig, Plugin, PluginInfo, PluginMidiMessage, ProcessContext};
use crate::audio::envelope::{EnvelopeGenerator, EnvelopeSettings, EnvelopeType};
use crate::audio::filter::{FilterMode, StateVariableFilter};
use crate::audio::lfo::{LfoGenerator, LfoSettings, LfoWaveform, TimeDivision};
use crate::audio::params::{
    hints, ParameterCategory, ParameterInfo, ParameterSet, ParameterType,
};
use crate::audio::plugin::preset;
use crate::error::Result;

pub const POLYSYNTH_PLUGIN_ID: &str = "com.groovelab.polysynth";

const MAX_VOICES: usize = 8;

/// Oscillator waveform, by parameter index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OscWaveform {
    Sine,
    Saw,
    Square,
    Triangle,
    Noise,
}

impl OscWaveform {
    fn from_index(index: i32) -> Self {
        match index.clamp(0, 4) {
            0 => Self::Sine,
            1 => Self::Saw,
            2 => Self::Square,
            3 => Self::Triangle,
            _ => Self::Noise,
        }
    }
}

/// LFO routing inside the synth, by parameter index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LfoRoute {
    None,
    Pitch,
    Volume,
    FilterCutoff,
    Pan,
}

impl LfoRoute {
    fn from_index(index: i32) -> Self {
        match index.clamp(0, 4) {
            1 => Self::Pitch,
            2 => Self::Volume,
            3 => Self::FilterCutoff,
            4 => Self::Pan,
            _ => Self::None,
        }
    }
}

fn lfo_waveform_from_index(index: i32) -> LfoWaveform {
    match index.clamp(0, 6) {
        0 => LfoWaveform::Sine,
        1 => LfoWaveform::Triangle,
        2 => LfoWaveform::Square,
        3 => LfoWaveform::SawUp,
        4 => LfoWaveform::SawDown,
        5 => LfoWaveform::RandomStep,
        _ => LfoWaveform::RandomSmooth,
    }
}

fn filter_mode_from_index(index: i32) -> FilterMode {
    match index.clamp(0, 2) {
        0 => FilterMode::LowPass,
        1 => FilterMode::BandPass,
        _ => FilterMode::HighPass,
    }
}

/// One oscillator's phase state. Saw and square get PolyBLEP corrections
/// at their discontinuities.
#[derive(Debug, Default, Clone, Copy)]
struct VoiceOsc {
    phase: f32,
    phase_increment: f32,
}

impl VoiceOsc {
    fn set_frequency(&mut self, frequency: f32, sample_rate: f32) {
        if sample_rate > 0.0 {
            self.phase_increment = frequency / sample_rate;
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn process(&mut self, waveform: OscWaveform) -> f32 {
        let phase = self.phase;
        let dt = self.phase_increment;
        let mut output = match waveform {
            OscWaveform::Sine => (2.0 * std::f32::consts::PI * phase).sin(),
            OscWaveform::Saw => {
                let mut out = 2.0 * phase - 1.0;
                if dt > 0.0 {
                    if phase < dt {
                        let t = phase / dt;
                        out -= t * t - 2.0 * t + 1.0;
                    } else if phase > 1.0 - dt {
                        let t = (phase - 1.0) / dt;
                        out -= t * t + 2.0 * t + 1.0;
                    }
                }
                out
            }
            OscWaveform::Square => {
                let mut out = if phase < 0.5 { 1.0 } else { -1.0 };
                if dt > 0.0 {
                    // Rising edge at 0, falling edge at 0.5
                    if phase < dt {
                        let t = phase / dt;
                        out += t + t - t * t - 1.0;
                    } else if phase > 1.0 - dt {
                        let t = (phase - 1.0) / dt;
                        out += t * t + t + t + 1.0;
                    }
                    if phase > 0.5 - dt && phase < 0.5 {
                        let t = (phase - 0.5) / dt;
                        out -= t + t - t * t - 1.0;
                    } else if phase > 0.5 && phase < 0.5 + dt {
                        let t = (phase - 0.5) / dt;
                        out -= t * t + t + t + 1.0;
                    }
                }
                out
            }
            OscWaveform::Triangle => {
                if phase < 0.5 {
                    4.0 * phase - 1.0
                } else {
                    3.0 - 4.0 * phase
                }
            }
            // Noise is generated by the synth's shared source
            OscWaveform::Noise => 0.0,
        };

        self.phase += dt;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        if !output.is_finite() {
            output = 0.0;
        }
        output
    }
}

struct SynthVoice {
    active: bool,
    releasing: bool,
    sustain_held: bool,
    midi_note: u8,
    velocity: f32,
    base_frequency: f32,
    current_frequency: f32,
    portamento_rate: f32,
    note_on_age: u64,
    osc1: VoiceOsc,
    osc2: VoiceOsc,
    sub_osc: VoiceOsc,
    amp_env: EnvelopeGenerator,
    filter_env: EnvelopeGenerator,
    filter: StateVariableFilter,
    lfo1: LfoGenerator,
    lfo2: LfoGenerator,
}

impl SynthVoice {
    fn new(seed: u64) -> Self {
        Self {
            active: false,
            releasing: false,
            sustain_held: false,
            midi_note: 60,
            velocity: 0.0,
            base_frequency: 440.0,
            current_frequency: 440.0,
            portamento_rate: 1.0,
            note_on_age: 0,
            osc1: VoiceOsc::default(),
            osc2: VoiceOsc::default(),
            sub_osc: VoiceOsc::default(),
            amp_env: EnvelopeGenerator::new(),
            filter_env: EnvelopeGenerator::new(),
            filter: StateVariableFilter::new(),
            lfo1: LfoGenerator::with_seed(seed),
            lfo2: LfoGenerator::with_seed(seed.wrapping_add(0x9E37_79B9_7F4A_7C15)),
        }
    }
}

/// Parameter values cached once per block.
#[derive(Debug, Default, Clone, Copy)]
struct CachedParams {
    osc1_wave: i32,
    osc1_octave: f32,
    osc1_semi: f32,
    osc1_fine: f32,
    osc1_level: f32,
    osc2_wave: i32,
    osc2_octave: f32,
    osc2_semi: f32,
    osc2_fine: f32,
    osc2_level: f32,
    sub_level: f32,
    noise_level: f32,
    amp_attack: f32,
    amp_decay: f32,
    amp_sustain: f32,
    amp_release: f32,
    filter_type: i32,
    filter_cutoff: f32,
    filter_resonance: f32,
    filter_env_amt: f32,
    filter_key_track: f32,
    filter_vel_sens: f32,
    filt_attack: f32,
    filt_decay: f32,
    filt_sustain: f32,
    filt_release: f32,
    lfo1_rate: f32,
    lfo1_depth: f32,
    lfo1_shape: i32,
    lfo1_dest: i32,
    lfo2_rate: f32,
    lfo2_depth: f32,
    lfo2_shape: i32,
    lfo2_dest: i32,
    master_volume: f32,
    pan: f32,
    portamento: f32,
    pitch_bend_range: f32,
}

pub struct PolySynth {
    config: AudioIoConfig,
    parameters: ParameterSet,
    voices: Vec<SynthVoice>,
    global_age: u64,
    pitch_bend: f32,
    sustain_pedal: bool,
    mod_wheel: f32,
    noise_rng: SmallRng,
}

impl Default for PolySynth {
    fn default() -> Self {
        Self::new()
    }
}

impl PolySynth {
    pub fn new() -> Self {
        let mut rng = SmallRng::from_entropy();
        let voices = (0..MAX_VOICES).map(|_| SynthVoice::new(rng.gen())).collect();
        Self {
            config: AudioIoConfig::default(),
            parameters: build_parameters(),
            voices,
            global_age: 0,
            pitch_bend: 0.0,
            sustain_pedal: false,
            mod_wheel: 0.0,
            noise_rng: rng,
        }
    }

    fn param_f32(&self, id: &str, default: f32) -> f32 {
        self.parameters.get(id).map(|p| p.get() as f32).unwrap_or(default)
    }

    fn param_i32(&self, id: &str, default: i32) -> i32 {
        self.parameters.get(id).map(|p| p.get() as i32).unwrap_or(default)
    }

    fn read_params(&self) -> CachedParams {
        CachedParams {
            osc1_wave: self.param_i32("osc1_wave", 1),
            osc1_octave: self.param_f32("osc1_octave", 0.0),
            osc1_semi: self.param_f32("osc1_semi", 0.0),
            osc1_fine: self.param_f32("osc1_fine", 0.0),
            osc1_level: self.param_f32("osc1_level", 1.0),
            osc2_wave: self.param_i32("osc2_wave", 0),
            osc2_octave: self.param_f32("osc2_octave", 0.0),
            osc2_semi: self.param_f32("osc2_semi", 0.0),
            osc2_fine: self.param_f32("osc2_fine", 5.0),
            osc2_level: self.param_f32("osc2_level", 0.0),
            sub_level: self.param_f32("sub_level", 0.0),
            noise_level: self.param_f32("noise_level", 0.0),
            amp_attack: self.param_f32("amp_attack", 10.0),
            amp_decay: self.param_f32("amp_decay", 150.0),
            amp_sustain: self.param_f32("amp_sustain", 1.0),
            amp_release: self.param_f32("amp_release", 200.0),
            filter_type: self.param_i32("filter_type", 0),
            filter_cutoff: self.param_f32("filter_cutoff", 8000.0),
            filter_resonance: self.param_f32("filter_resonance", 0.707),
            filter_env_amt: self.param_f32("filter_env_amt", 0.0),
            filter_key_track: self.param_f32("filter_key_track", 0.0),
            filter_vel_sens: self.param_f32("filter_vel_sens", 0.0),
            filt_attack: self.param_f32("filt_attack", 10.0),
            filt_decay: self.param_f32("filt_decay", 150.0),
            filt_sustain: self.param_f32("filt_sustain", 0.5),
            filt_release: self.param_f32("filt_release", 200.0),
            lfo1_rate: self.param_f32("lfo1_rate", 2.0),
            lfo1_depth: self.param_f32("lfo1_depth", 0.0),
            lfo1_shape: self.param_i32("lfo1_shape", 0),
            lfo1_dest: self.param_i32("lfo1_dest", 1),
            lfo2_rate: self.param_f32("lfo2_rate", 1.0),
            lfo2_depth: self.param_f32("lfo2_depth", 0.0),
            lfo2_shape: self.param_i32("lfo2_shape", 0),
            lfo2_dest: self.param_i32("lfo2_dest", 3),
            master_volume: self.param_f32("master_volume", 0.7),
            pan: self.param_f32("pan", 0.0),
            portamento: self.param_f32("portamento", 0.0),
            pitch_bend_range: self.param_f32("pitch_bend_range", 2.0),
        }
    }

    fn note_to_frequency(note: u8) -> f32 {
        440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
    }

    fn find_voice_by_note(&mut self, note: u8) -> Option<usize> {
        self.voices.iter().position(|v| v.active && v.midi_note == note)
    }

    /// Inactive first, then the oldest releasing voice, then the oldest
    /// active one.
    fn find_free_voice(&mut self) -> Option<usize> {
        if let Some(index) = self.voices.iter().position(|v| !v.active) {
            return Some(index);
        }
        let oldest_releasing = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.releasing)
            .min_by_key(|(_, v)| v.note_on_age)
            .map(|(i, _)| i);
        if oldest_releasing.is_some() {
            return oldest_releasing;
        }
        self.voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.active)
            .min_by_key(|(_, v)| v.note_on_age)
            .map(|(i, _)| i)
    }

    fn configure_voice(&mut self, index: usize, frequency: f32, velocity: f32, fresh: bool) {
        let sample_rate = self.config.sample_rate;
        let params = self.read_params();
        let voice = &mut self.voices[index];

        voice.base_frequency = frequency;

        // Portamento: only a legato retrigger of an already-sounding note
        // is glide-eligible; voices from the allocator jump to the target
        if params.portamento > 0.0
            && !fresh
            && voice.current_frequency > 0.0
            && voice.current_frequency != frequency
        {
            let port_samples = (params.portamento * 0.001 * sample_rate).max(1.0);
            voice.portamento_rate = (frequency / voice.current_frequency).powf(1.0 / port_samples);
        } else {
            voice.current_frequency = frequency;
            voice.portamento_rate = 1.0;
        }

        let amp_settings = EnvelopeSettings {
            envelope_type: EnvelopeType::Adsr,
            attack_ms: params.amp_attack.max(1.0),
            hold_ms: 0.0,
            decay_ms: params.amp_decay.max(1.0),
            sustain_level: params.amp_sustain.clamp(0.0, 1.0),
            release_ms: params.amp_release.max(1.0),
            velocity_to_attack: 0.0,
            velocity_to_level: 0.0,
        };
        voice.amp_env.configure(amp_settings, sample_rate, velocity);
        voice.amp_env.trigger_on(velocity);

        let filter_settings = EnvelopeSettings {
            envelope_type: EnvelopeType::Adsr,
            attack_ms: params.filt_attack.max(1.0),
            hold_ms: 0.0,
            decay_ms: params.filt_decay.max(1.0),
            sustain_level: params.filt_sustain.clamp(0.0, 1.0),
            release_ms: params.filt_release.max(1.0),
            velocity_to_attack: 0.0,
            velocity_to_level: 0.0,
        };
        voice.filter_env.configure(filter_settings, sample_rate, velocity);
        voice.filter_env.trigger_on(velocity);

        voice.filter.set_sample_rate(sample_rate);
        voice.filter.reset();
        voice.filter.configure(
            filter_mode_from_index(params.filter_type),
            params.filter_cutoff.clamp(20.0, 20000.0),
            params.filter_resonance.clamp(0.5, 20.0),
        );

        let lfo1_settings = LfoSettings {
            enabled: true,
            waveform: lfo_waveform_from_index(params.lfo1_shape),
            rate_hz: params.lfo1_rate.max(0.01),
            sync_to_tempo: false,
            tempo_division: TimeDivision::None,
            depth: params.lfo1_depth,
            destination: crate::audio::lfo::LfoDestination::None,
        };
        voice.lfo1.configure(lfo1_settings, sample_rate, 120.0);
        voice.lfo1.retrigger();

        let lfo2_settings = LfoSettings {
            enabled: true,
            waveform: lfo_waveform_from_index(params.lfo2_shape),
            rate_hz: params.lfo2_rate.max(0.01),
            sync_to_tempo: false,
            tempo_division: TimeDivision::None,
            depth: params.lfo2_depth,
            destination: crate::audio::lfo::LfoDestination::None,
        };
        voice.lfo2.configure(lfo2_settings, sample_rate, 120.0);
        voice.lfo2.retrigger();

        // Clean transient for fresh voices; legato retrigger keeps phases
        if fresh {
            voice.osc1.reset();
            voice.osc2.reset();
            voice.sub_osc.reset();
        }
    }

    fn note_on(&mut self, note: u8, velocity: f32) {
        // Reuse the sounding voice for the same note (legato retrigger)
        let existing = self.find_voice_by_note(note);
        let fresh = existing.is_none();
        let index = match existing.or_else(|| self.find_free_voice()) {
            Some(index) => index,
            None => {
                log::warn!("no voice available for note {note}");
                return;
            }
        };

        self.global_age += 1;
        let age = self.global_age;
        {
            let voice = &mut self.voices[index];
            voice.midi_note = note;
            voice.velocity = velocity;
            voice.active = true;
            voice.releasing = false;
            voice.sustain_held = false;
            voice.note_on_age = age;
        }
        self.configure_voice(index, Self::note_to_frequency(note), velocity, fresh);
        log::debug!("note on: {note} vel={velocity:.2}");
    }

    fn note_off(&mut self, note: u8) {
        let Some(index) = self.find_voice_by_note(note) else {
            return;
        };
        if self.sustain_pedal {
            self.voices[index].sustain_held = true;
            return;
        }
        let voice = &mut self.voices[index];
        voice.releasing = true;
        voice.amp_env.trigger_off();
        voice.filter_env.trigger_off();
        log::debug!("note off: {note}");
    }

    fn release_sustained_voices(&mut self) {
        for voice in &mut self.voices {
            if voice.active && voice.sustain_held {
                voice.sustain_held = false;
                voice.releasing = true;
                voice.amp_env.trigger_off();
                voice.filter_env.trigger_off();
            }
        }
    }

    fn all_notes_off(&mut self) {
        for voice in &mut self.voices {
            voice.active = false;
            voice.releasing = false;
            voice.sustain_held = false;
            voice.amp_env.reset();
            voice.filter_env.reset();
        }
        self.pitch_bend = 0.0;
        self.sustain_pedal = false;
        log::info!("all notes off");
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }
}

impl Plugin for PolySynth {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: POLYSYNTH_PLUGIN_ID.to_string(),
            name: "Poly Synth".to_string(),
            vendor: "nanoshrine interactive".to_string(),
            version: "2.0.0".to_string(),
            is_synth: true,
            accepts_midi: true,
        }
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn initialize(&mut self, config: &AudioIoConfig) -> Result<()> {
        self.config = *config;
        for voice in &mut self.voices {
            voice.active = false;
            voice.releasing = false;
            voice.sustain_held = false;
            voice.portamento_rate = 1.0;
            voice.amp_env.reset();
            voice.filter_env.reset();
            voice.filter.set_sample_rate(config.sample_rate);
            voice.filter.reset();
            voice.osc1.reset();
            voice.osc2.reset();
            voice.sub_osc.reset();
        }
        self.pitch_bend = 0.0;
        self.sustain_pedal = false;
        self.mod_wheel = 0.0;
        log::info!(
            "synth initialized: {} Hz, {} channels",
            config.sample_rate,
            config.output_channels
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.all_notes_off();
    }

    fn process_audio(&mut self, context: &mut ProcessContext) -> Result<()> {
        // Queued changes apply at block start, best effort
        self.parameters.apply_changes(context.parameter_changes);

        let params = self.read_params();
        let sample_rate = self.config.sample_rate;
        let pitch_bend = self.pitch_bend;
        let mod_wheel = self.mod_wheel;
        let pb_mult = 2.0_f32.powf(pitch_bend * params.pitch_bend_range / 12.0);
        let lfo1_route = LfoRoute::from_index(params.lfo1_dest);
        let lfo2_route = LfoRoute::from_index(params.lfo2_dest);
        let wave1 = OscWaveform::from_index(params.osc1_wave);
        let wave2 = OscWaveform::from_index(params.osc2_wave);

        for frame in 0..context.frame_count {
            let mut left_out = 0.0f32;
            let mut right_out = 0.0f32;

            for voice in &mut self.voices {
                if !voice.active {
                    continue;
                }

                // Portamento glide toward the target frequency
                if voice.portamento_rate != 1.0 {
                    voice.current_frequency *= voice.portamento_rate;
                    let overshot = if voice.portamento_rate > 1.0 {
                        voice.current_frequency >= voice.base_frequency
                    } else {
                        voice.current_frequency <= voice.base_frequency
                    };
                    if overshot {
                        voice.current_frequency = voice.base_frequency;
                        voice.portamento_rate = 1.0;
                    }
                }

                let lfo1_raw = voice.lfo1.process();
                let lfo2_raw = voice.lfo2.process();
                let lfo1_out = lfo1_raw * params.lfo1_depth * (1.0 + mod_wheel * 2.0);
                let lfo2_out = lfo2_raw * params.lfo2_depth;

                // Pitch modulation is ±5% per routed LFO
                let mut pitch_mod = 0.0f32;
                if lfo1_route == LfoRoute::Pitch {
                    pitch_mod += lfo1_out * 0.05;
                }
                if lfo2_route == LfoRoute::Pitch {
                    pitch_mod += lfo2_out * 0.05;
                }

                let base_freq = voice.current_frequency * pb_mult * (1.0 + pitch_mod);
                let freq1 = base_freq
                    * 2.0_f32
                        .powf((params.osc1_octave * 12.0 + params.osc1_semi + params.osc1_fine * 0.01) / 12.0);
                let freq2 = base_freq
                    * 2.0_f32
                        .powf((params.osc2_octave * 12.0 + params.osc2_semi + params.osc2_fine * 0.01) / 12.0);
                let freq_sub = base_freq * 0.5;

                voice.osc1.set_frequency(freq1, sample_rate);
                voice.osc2.set_frequency(freq2, sample_rate);
                voice.sub_osc.set_frequency(freq_sub, sample_rate);

                let osc1_out = if wave1 == OscWaveform::Noise {
                    self.noise_rng.gen_range(-1.0..=1.0)
                } else {
                    voice.osc1.process(wave1)
                };
                let osc2_out = if wave2 == OscWaveform::Noise {
                    self.noise_rng.gen_range(-1.0..=1.0)
                } else {
                    voice.osc2.process(wave2)
                };
                let sub_out = voice.sub_osc.process(OscWaveform::Sine);
                let noise_out: f32 = self.noise_rng.gen_range(-1.0..=1.0);

                let mut osc_mix = osc1_out * params.osc1_level
                    + osc2_out * params.osc2_level
                    + sub_out * params.sub_level
                    + noise_out * params.noise_level;
                // Soft clip the oscillator mix before the filter
                osc_mix = (osc_mix * 0.8).tanh();

                let amp_env_val = voice.amp_env.process();
                if !voice.amp_env.is_active() && voice.releasing {
                    voice.active = false;
                    voice.releasing = false;
                    voice.filter_env.process();
                    continue;
                }

                let filt_env_val = voice.filter_env.process();

                let mut lfo_filter_mod = 0.0f32;
                if lfo1_route == LfoRoute::FilterCutoff {
                    lfo_filter_mod += lfo1_out;
                }
                if lfo2_route == LfoRoute::FilterCutoff {
                    lfo_filter_mod += lfo2_out;
                }

                // Key tracking around note 60, velocity opens the filter,
                // envelope contributes up to ±4 octaves, LFO up to ±2
                let key_octaves = (voice.midi_note as f32 - 60.0) / 12.0;
                let key_mult = 2.0_f32.powf(key_octaves * params.filter_key_track);
                let vel_mult = 1.0 + (voice.velocity - 0.5) * params.filter_vel_sens * 2.0;
                let env_mult = 2.0_f32.powf(params.filter_env_amt * filt_env_val * 4.0);
                let lfo_mult = 2.0_f32.powf(lfo_filter_mod * 2.0);
                let mod_cutoff = (params.filter_cutoff * key_mult * vel_mult * env_mult * lfo_mult)
                    .clamp(20.0, 20000.0);

                voice.filter.configure(
                    filter_mode_from_index(params.filter_type),
                    mod_cutoff,
                    params.filter_resonance,
                );
                let filtered = voice.filter.process(osc_mix);

                let mut vol_mod = 1.0f32;
                if lfo1_route == LfoRoute::Volume {
                    vol_mod *= 1.0 + lfo1_out * 0.5;
                }
                if lfo2_route == LfoRoute::Volume {
                    vol_mod *= 1.0 + lfo2_out * 0.5;
                }

                let mut voice_pan = params.pan;
                if lfo1_route == LfoRoute::Pan {
                    voice_pan += lfo1_out * 0.3;
                }
                if lfo2_route == LfoRoute::Pan {
                    voice_pan += lfo2_out * 0.3;
                }
                voice_pan = voice_pan.clamp(-1.0, 1.0);

                let voice_out = filtered * amp_env_val * voice.velocity * vol_mod;
                let left_gain = (0.5 * (1.0 - voice_pan)).sqrt();
                let right_gain = (0.5 * (1.0 + voice_pan)).sqrt();

                left_out += voice_out * left_gain;
                right_out += voice_out * right_gain;
            }

            left_out = (left_out * params.master_volume * 0.7).tanh();
            right_out = (right_out * params.master_volume * 0.7).tanh();

            if let Some(channel) = context.outputs.get_mut(0) {
                channel[frame] = left_out;
            }
            if let Some(channel) = context.outputs.get_mut(1) {
                channel[frame] = right_out;
            }
        }
        Ok(())
    }

    fn process_midi(&mut self, message: &PluginMidiMessage) {
        match message.status & 0xF0 {
            0x90 => {
                if message.data2 > 0 {
                    self.note_on(message.data1, message.data2 as f32 / 127.0);
                } else {
                    self.note_off(message.data1);
                }
            }
            0x80 => self.note_off(message.data1),
            0xB0 => match message.data1 {
                1 => self.mod_wheel = message.data2 as f32 / 127.0,
                64 => {
                    if message.data2 >= 64 {
                        self.sustain_pedal = true;
                    } else {
                        self.sustain_pedal = false;
                        self.release_sustained_voices();
                    }
                }
                120 | 123 => self.all_notes_off(),
                _ => {}
            },
            0xE0 => {
                // data2 is the MSB, data1 the LSB
                let raw = ((message.data2 as i32) << 7) | message.data1 as i32;
                self.pitch_bend = ((raw - 8192) as f32 / 8192.0).clamp(-1.0, 1.0);
            }
            _ => {}
        }
    }

    fn save_state(&self) -> Vec<u8> {
        preset::encode_state(&self.parameters)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<()> {
        preset::apply_state(&self.parameters, state)
    }
}

fn build_parameters() -> ParameterSet {
    use ParameterCategory as Cat;
    use ParameterType as Ty;

    const AUTO: u32 = hints::AUTOMATABLE;
    const LOG: u32 = AUTO | hints::LOGARITHMIC;
    const BIPO: u32 = AUTO | hints::BIPOLAR;

    let mut set = ParameterSet::new();
    let mut add = |id: &str,
                   name: &str,
                   units: &str,
                   ty: Ty,
                   cat: Cat,
                   min: f64,
                   max: f64,
                   default: f64,
                   hint_bits: u32,
                   step: f64| {
        let info = ParameterInfo::new(id, name, units, ty, cat, min, max, default, hint_bits)
            .with_step(step);
        set.register(info).expect("synth parameter table must be valid");
    };

    // OSC 1
    add("osc1_wave", "OSC1 Wave", "", Ty::Choice, Cat::Control, 0.0, 4.0, 1.0, AUTO, 1.0);
    add("osc1_octave", "OSC1 Octave", "oct", Ty::Int, Cat::Control, -2.0, 2.0, 0.0, AUTO, 1.0);
    add("osc1_semi", "OSC1 Semi", "st", Ty::Int, Cat::Control, -12.0, 12.0, 0.0, AUTO, 1.0);
    add("osc1_fine", "OSC1 Fine", "ct", Ty::Float, Cat::Control, -100.0, 100.0, 0.0, BIPO, 0.0);
    add("osc1_level", "OSC1 Level", "%", Ty::Float, Cat::Control, 0.0, 1.0, 1.0, AUTO, 0.0);
    // OSC 2
    add("osc2_wave", "OSC2 Wave", "", Ty::Choice, Cat::Control, 0.0, 4.0, 0.0, AUTO, 1.0);
    add("osc2_octave", "OSC2 Octave", "oct", Ty::Int, Cat::Control, -2.0, 2.0, 0.0, AUTO, 1.0);
    add("osc2_semi", "OSC2 Semi", "st", Ty::Int, Cat::Control, -12.0, 12.0, 0.0, AUTO, 1.0);
    add("osc2_fine", "OSC2 Fine", "ct", Ty::Float, Cat::Control, -100.0, 100.0, 5.0, BIPO, 0.0);
    add("osc2_level", "OSC2 Level", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.0, AUTO, 0.0);
    // Sub / noise
    add("sub_level", "Sub Level", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.0, AUTO, 0.0);
    add("noise_level", "Noise Level", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.0, AUTO, 0.0);
    // Amp envelope
    add("amp_attack", "Amp Attack", "ms", Ty::Float, Cat::Control, 1.0, 10000.0, 10.0, LOG, 0.0);
    add("amp_decay", "Amp Decay", "ms", Ty::Float, Cat::Control, 1.0, 5000.0, 150.0, LOG, 0.0);
    add("amp_sustain", "Amp Sustain", "%", Ty::Float, Cat::Control, 0.0, 1.0, 1.0, AUTO, 0.0);
    add("amp_release", "Amp Release", "ms", Ty::Float, Cat::Control, 1.0, 10000.0, 200.0, LOG, 0.0);
    // Filter
    add("filter_type", "Filter Type", "", Ty::Choice, Cat::Control, 0.0, 2.0, 0.0, AUTO, 1.0);
    add("filter_cutoff", "Filter Cutoff", "Hz", Ty::Float, Cat::Control, 20.0, 20000.0, 8000.0, LOG, 0.0);
    add("filter_resonance", "Filter Res", "Q", Ty::Float, Cat::Control, 0.5, 20.0, 0.707, LOG, 0.0);
    add("filter_env_amt", "Filter Env Amt", "%", Ty::Float, Cat::Control, -1.0, 1.0, 0.0, BIPO, 0.0);
    add("filter_key_track", "Key Track", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.0, AUTO, 0.0);
    add("filter_vel_sens", "Vel Sens", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.0, AUTO, 0.0);
    // Filter envelope
    add("filt_attack", "Filt Attack", "ms", Ty::Float, Cat::Control, 1.0, 10000.0, 10.0, LOG, 0.0);
    add("filt_decay", "Filt Decay", "ms", Ty::Float, Cat::Control, 1.0, 5000.0, 150.0, LOG, 0.0);
    add("filt_sustain", "Filt Sustain", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.5, AUTO, 0.0);
    add("filt_release", "Filt Release", "ms", Ty::Float, Cat::Control, 1.0, 10000.0, 200.0, LOG, 0.0);
    // LFO 1
    add("lfo1_rate", "LFO1 Rate", "Hz", Ty::Float, Cat::Modulation, 0.01, 20.0, 2.0, LOG, 0.0);
    add("lfo1_depth", "LFO1 Depth", "%", Ty::Float, Cat::Modulation, 0.0, 1.0, 0.0, AUTO, 0.0);
    add("lfo1_shape", "LFO1 Shape", "", Ty::Choice, Cat::Modulation, 0.0, 6.0, 0.0, AUTO, 1.0);
    add("lfo1_dest", "LFO1 Dest", "", Ty::Choice, Cat::Modulation, 0.0, 4.0, 1.0, AUTO, 1.0);
    // LFO 2
    add("lfo2_rate", "LFO2 Rate", "Hz", Ty::Float, Cat::Modulation, 0.01, 20.0, 1.0, LOG, 0.0);
    add("lfo2_depth", "LFO2 Depth", "%", Ty::Float, Cat::Modulation, 0.0, 1.0, 0.0, AUTO, 0.0);
    add("lfo2_shape", "LFO2 Shape", "", Ty::Choice, Cat::Modulation, 0.0, 6.0, 0.0, AUTO, 1.0);
    add("lfo2_dest", "LFO2 Dest", "", Ty::Choice, Cat::Modulation, 0.0, 4.0, 3.0, AUTO, 1.0);
    // Master
    add("master_volume", "Master Volume", "%", Ty::Float, Cat::Control, 0.0, 1.0, 0.7, AUTO, 0.0);
    add("pan", "Pan", "", Ty::Float, Cat::Control, -1.0, 1.0, 0.0, BIPO, 0.0);
    add("portamento", "Portamento", "ms", Ty::Float, Cat::Control, 0.0, 2000.0, 0.0, LOG, 0.0);
    add("pitch_bend_range", "PB Range", "st", Ty::Float, Cat::Control, 0.0, 24.0, 2.0, AUTO, 0.0);

    set
}
