//! Sample storage and drum-pad playback
//!
//! Samples are decoded to interleaved f32, stored behind `Arc` so active
//! voices keep a sample alive after it is unloaded from the store. Pads
//! resolve velocity layers, spawn `ActiveSound` voices with their own
//! envelopes, filter and LFOs, and the player mixes every active voice
//! into the output block under a single short lock.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::envelope::{EnvelopeGenerator, EnvelopeSettings};
use super::filter::{FilterSettings, StateVariableFilter};
use super::lfo::{LfoDestination, LfoGenerator, LfoSettings};
use crate::error::{EngineError, Result};

/// Upper bound on concurrently playing sounds. The active vector is
/// reserved to this capacity up front so triggering never reallocates on
/// the audio thread.
const MAX_ACTIVE_SOUNDS: usize = 128;

/// LFO slots per sample voice
const MAX_SOUND_LFOS: usize = 4;

/// Number of drum pads
pub const PAD_COUNT: usize = 16;

static PAD_KEYS: [&str; PAD_COUNT] = [
    "pad_0", "pad_1", "pad_2", "pad_3", "pad_4", "pad_5", "pad_6", "pad_7", "pad_8", "pad_9",
    "pad_10", "pad_11", "pad_12", "pad_13", "pad_14", "pad_15",
];

/// Key used in the pad settings map for a pad index.
pub fn pad_key(index: usize) -> &'static str {
    PAD_KEYS[index]
}

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// An immutable, decoded audio sample.
pub struct Sample {
    pub id: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub frame_count: usize,
    /// Interleaved float data in [-1, 1]; `frame_count * channels` samples
    pub data: Vec<f32>,
}

impl Sample {
    /// Mono value of a frame; stereo frames are summed and halved.
    #[inline]
    pub fn frame_mono(&self, frame: usize) -> f32 {
        match self.channels {
            1 => self.data[frame],
            _ => {
                let i = frame * 2;
                (self.data[i] + self.data[i + 1]) * 0.5
            }
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frame_count as f64 / self.sample_rate as f64
    }
}

/// Where to decode a sample from.
pub enum SampleSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl From<&str> for SampleSource {
    fn from(path: &str) -> Self {
        SampleSource::File(PathBuf::from(path))
    }
}

struct DecodedAudio {
    data: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

fn decode_wav(source: SampleSource) -> Result<DecodedAudio> {
    let mss = match source {
        SampleSource::File(path) => {
            let file = std::fs::File::open(&path)?;
            MediaSourceStream::new(Box::new(file), Default::default())
        }
        SampleSource::Bytes(bytes) => {
            MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes)), Default::default())
        }
    };

    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| EngineError::Corrupt(format!("unrecognized audio container: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::Corrupt("no decodable audio track".to_string()))?;
    let track_id = track.id;

    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    if channels == 0 || channels > 2 {
        return Err(EngineError::InvalidArgument(format!(
            "unsupported channel count: {channels} (must be 1 or 2)"
        )));
    }
    if sample_rate == 0 {
        return Err(EngineError::InvalidArgument("invalid sample rate: 0".to_string()));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::Corrupt(format!("unsupported encoding: {e}")))?;

    let mut data: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(EngineError::Corrupt(format!("packet read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                data.extend_from_slice(buf.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("skipping undecodable packet: {e}");
            }
            Err(e) => return Err(EngineError::Corrupt(format!("decode failed: {e}"))),
        }
    }

    Ok(DecodedAudio {
        data,
        channels: channels as u16,
        sample_rate,
    })
}

// --- Pad settings ---

/// One velocity layer of a pad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleLayer {
    pub id: String,
    pub sample_id: String,
    pub enabled: bool,
    pub velocity_range_min: u8,
    pub velocity_range_max: u8,
    pub tuning_coarse_offset: i32,
    pub tuning_fine_offset: i32,
    pub volume_offset_db: f32,
    pub pan_offset: f32,
}

impl SampleLayer {
    pub fn new(sample_id: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            sample_id: sample_id.into(),
            enabled: true,
            velocity_range_min: 0,
            velocity_range_max: 127,
            tuning_coarse_offset: 0,
            tuning_fine_offset: 0,
            volume_offset_db: 0.0,
            pan_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerTriggerRule {
    /// First enabled layer whose range contains the incoming velocity
    Velocity,
    /// Round-robin over enabled layers
    Cycle,
    /// Uniform random over enabled layers
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    OneShot,
    Loop,
    /// Carried in the pad model; playback treats it as one-shot
    Gate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PadSettings {
    pub id: String,
    pub layers: Vec<SampleLayer>,
    pub layer_trigger_rule: LayerTriggerRule,
    #[serde(default)]
    pub current_cycle_layer_index: usize,
    pub playback_mode: PlaybackMode,
    /// Semitones
    pub tuning_coarse: i32,
    /// Cents
    pub tuning_fine: i32,
    /// 0.0 to 2.0
    pub volume: f32,
    /// -1.0 to 1.0
    pub pan: f32,
    /// 0 = none
    pub mute_group: u32,
    /// Maximum concurrent sounds for this pad
    pub polyphony: usize,
    pub amp_envelope: EnvelopeSettings,
    pub filter_envelope: Option<EnvelopeSettings>,
    pub filter: Option<FilterSettings>,
    pub pitch_envelope: Option<EnvelopeSettings>,
    pub lfos: Vec<LfoSettings>,
}

impl Default for PadSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            layers: Vec::new(),
            layer_trigger_rule: LayerTriggerRule::Velocity,
            current_cycle_layer_index: 0,
            playback_mode: PlaybackMode::OneShot,
            tuning_coarse: 0,
            tuning_fine: 0,
            volume: 1.0,
            pan: 0.0,
            mute_group: 0,
            polyphony: 16,
            amp_envelope: EnvelopeSettings::default(),
            filter_envelope: None,
            filter: None,
            pitch_envelope: None,
            lfos: Vec::new(),
        }
    }
}

// --- Active sounds ---

/// A playing sample voice.
pub struct ActiveSound {
    sample: Arc<Sample>,
    /// Pad that spawned this sound, if any (free triggers have none)
    pad_index: Option<usize>,
    playback_mode: PlaybackMode,
    /// Fractional read position in frames
    position: f64,
    playback_speed: f64,
    volume: f32,
    pan: f32,
    mute_group: u32,
    amp_env: EnvelopeGenerator,
    filter: Option<StateVariableFilter>,
    filter_settings: Option<FilterSettings>,
    filter_env: Option<EnvelopeGenerator>,
    pitch_env: Option<EnvelopeGenerator>,
    lfos: [Option<LfoGenerator>; MAX_SOUND_LFOS],
}

impl ActiveSound {
    /// Simple free-running one-shot with a held envelope (releases on
    /// `stop_all_samples`).
    fn free_running(sample: Arc<Sample>, volume: f32, pan: f32, sample_rate: f32) -> Self {
        let mut amp_env = EnvelopeGenerator::new();
        amp_env.configure(
            EnvelopeSettings {
                attack_ms: 0.0,
                decay_ms: 0.0,
                sustain_level: 1.0,
                release_ms: 5.0,
                ..EnvelopeSettings::default()
            },
            sample_rate,
            1.0,
        );
        amp_env.trigger_on(1.0);
        let playback_speed = sample.sample_rate as f64 / sample_rate as f64;
        Self {
            sample,
            pad_index: None,
            playback_mode: PlaybackMode::OneShot,
            position: 0.0,
            playback_speed,
            volume,
            pan: pan.clamp(-1.0, 1.0),
            mute_group: 0,
            amp_env,
            filter: None,
            filter_settings: None,
            filter_env: None,
            pitch_env: None,
            lfos: [None, None, None, None],
        }
    }

    fn release(&mut self) {
        self.amp_env.trigger_off();
    }

    fn is_finished(&self) -> bool {
        !self.amp_env.is_active()
    }

    /// Renders one frame and advances. Returns `None` once the sound is
    /// done (end of sample for one-shots, or amp envelope idle).
    #[inline]
    fn process_frame(&mut self) -> Option<(f32, f32)> {
        let frame = self.position as usize;
        if frame >= self.sample.frame_count {
            match self.playback_mode {
                PlaybackMode::Loop => {
                    self.position -= self.sample.frame_count as f64;
                }
                _ => return None,
            }
        }
        let frame = (self.position as usize).min(self.sample.frame_count - 1);

        let env = self.amp_env.process();
        if !self.amp_env.is_active() {
            return None;
        }

        // LFO modulation accumulators, scaled the same way the synth voice
        // scales its routed LFOs
        let mut pitch_mod = 0.0f64;
        let mut vol_mult = 1.0f32;
        let mut pan_add = 0.0f32;
        let mut cutoff_mod = 0.0f32;
        let mut res_mod = 0.0f32;
        for lfo in self.lfos.iter_mut().flatten() {
            let settings = lfo.settings();
            let destination = settings.destination;
            let depth = settings.depth;
            let out = lfo.process() * depth;
            match destination {
                LfoDestination::Pitch => pitch_mod += out as f64 * 0.05,
                LfoDestination::Volume => vol_mult *= 1.0 + out * 0.5,
                LfoDestination::Pan => pan_add += out * 0.3,
                LfoDestination::FilterCutoff => cutoff_mod += out,
                LfoDestination::FilterResonance => res_mod += out,
                LfoDestination::None => {}
            }
        }

        // Pitch envelope sweeps up to +1 octave at full value
        let pitch_env_mult = match &mut self.pitch_env {
            Some(env) => 2.0f64.powf(env.process() as f64),
            None => 1.0,
        };

        let mut value = self.sample.frame_mono(frame);

        if let (Some(filter), Some(settings)) = (&mut self.filter, &self.filter_settings) {
            let filt_env = match &mut self.filter_env {
                Some(env) => env.process(),
                None => 0.0,
            };
            let cutoff = (settings.cutoff_hz
                * 2.0f32.powf(settings.env_amount * filt_env * 4.0)
                * 2.0f32.powf(cutoff_mod * 2.0))
            .clamp(20.0, 20000.0);
            let resonance = settings.resonance * (1.0 + res_mod);
            filter.configure(settings.mode, cutoff, resonance);
            value = filter.process(value);
        }

        let out = value * env * self.volume * vol_mult;
        let pan = (self.pan + pan_add).clamp(-1.0, 1.0);
        let left = out * (0.5 * (1.0 - pan)).sqrt();
        let right = out * (0.5 * (1.0 + pan)).sqrt();

        self.position += self.playback_speed * pitch_env_mult * (1.0 + pitch_mod);
        Some((left, right))
    }
}

// --- Sample player ---

/// Owns the sample store, pad settings and all active sample voices.
pub struct SamplePlayer {
    samples: Mutex<HashMap<String, Arc<Sample>>>,
    pads: Mutex<HashMap<String, PadSettings>>,
    active: Mutex<Vec<ActiveSound>>,
    rng: Mutex<SmallRng>,
    stream_sample_rate: AtomicU32,
    tempo_bpm_bits: AtomicU32,
}

impl Default for SamplePlayer {
    fn default() -> Self {
        Self::new(48000)
    }
}

impl SamplePlayer {
    pub fn new(stream_sample_rate: u32) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            pads: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::with_capacity(MAX_ACTIVE_SOUNDS)),
            rng: Mutex::new(SmallRng::from_entropy()),
            stream_sample_rate: AtomicU32::new(stream_sample_rate),
            tempo_bpm_bits: AtomicU32::new(f32_to_u32(120.0)),
        }
    }

    pub fn set_stream_sample_rate(&self, sample_rate: u32) {
        if sample_rate > 0 {
            self.stream_sample_rate.store(sample_rate, Ordering::Relaxed);
        }
    }

    fn stream_sample_rate(&self) -> f32 {
        self.stream_sample_rate.load(Ordering::Relaxed) as f32
    }

    /// Tempo used when configuring tempo-synced LFOs of newly triggered
    /// sounds.
    pub fn set_tempo(&self, bpm: f32) {
        self.tempo_bpm_bits.store(f32_to_u32(bpm), Ordering::Relaxed);
    }

    fn tempo(&self) -> f32 {
        u32_to_f32(self.tempo_bpm_bits.load(Ordering::Relaxed))
    }

    // --- Sample store ---

    /// Decodes a WAV file (from a path or an in-memory buffer) and stores
    /// it under `id`. `frame_offset`/`frame_length` select a window of the
    /// decoded frames. Loading an id twice is a no-op.
    pub fn load_sample_to_memory(
        &self,
        id: &str,
        source: SampleSource,
        frame_offset: Option<u64>,
        frame_length: Option<u64>,
    ) -> Result<()> {
        if self.samples.lock().contains_key(id) {
            log::warn!("sample {id} already loaded, skipping");
            return Ok(());
        }

        let decoded = decode_wav(source)?;
        let channels = decoded.channels as usize;
        let total_frames = decoded.data.len() / channels;

        let start = frame_offset.unwrap_or(0) as usize;
        if start >= total_frames {
            return Err(EngineError::InvalidArgument(format!(
                "frame offset {start} exceeds total frames {total_frames}"
            )));
        }
        let available = total_frames - start;
        let take = match frame_length {
            Some(len) if len > 0 => (len as usize).min(available),
            _ => available,
        };
        if take == 0 {
            return Err(EngineError::InvalidArgument(format!("no frames to load for sample {id}")));
        }

        let data = decoded.data[start * channels..(start + take) * channels].to_vec();
        let sample = Arc::new(Sample {
            id: id.to_string(),
            channels: decoded.channels,
            sample_rate: decoded.sample_rate,
            frame_count: take,
            data,
        });
        log::info!(
            "loaded sample {id}: {} frames, {} channels, {} Hz",
            sample.frame_count,
            sample.channels,
            sample.sample_rate
        );
        self.samples.lock().insert(id.to_string(), sample);
        Ok(())
    }

    /// Inserts an already-decoded sample. Used by tests and in-process
    /// sound generation.
    pub fn insert_sample(&self, sample: Sample) {
        self.samples.lock().insert(sample.id.clone(), Arc::new(sample));
    }

    pub fn unload_sample(&self, id: &str) -> Result<()> {
        match self.samples.lock().remove(id) {
            Some(_) => {
                log::info!("sample unloaded: {id}");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("sample {id}"))),
        }
    }

    pub fn is_sample_loaded(&self, id: &str) -> bool {
        self.samples.lock().contains_key(id)
    }

    pub fn sample_rate_of(&self, id: &str) -> Result<u32> {
        self.samples
            .lock()
            .get(id)
            .map(|s| s.sample_rate)
            .ok_or_else(|| EngineError::NotFound(format!("sample {id}")))
    }

    pub fn loaded_sample_ids(&self) -> Vec<String> {
        self.samples.lock().keys().cloned().collect()
    }

    // --- Pad settings ---

    /// Replaces a pad's settings, resetting its layer cycle index.
    pub fn update_pad_settings(&self, pad: &str, mut settings: PadSettings) {
        settings.current_cycle_layer_index = 0;
        settings.polyphony = settings.polyphony.max(1);
        self.pads.lock().insert(pad.to_string(), settings);
    }

    pub fn pad_settings(&self, pad: &str) -> Option<PadSettings> {
        self.pads.lock().get(pad).cloned()
    }

    pub fn set_pad_volume(&self, pad: &str, volume: f32) -> Result<()> {
        let mut pads = self.pads.lock();
        let settings = pads
            .get_mut(pad)
            .ok_or_else(|| EngineError::NotFound(format!("pad {pad}")))?;
        settings.volume = volume.clamp(0.0, 2.0);
        Ok(())
    }

    pub fn set_pad_pan(&self, pad: &str, pan: f32) -> Result<()> {
        let mut pads = self.pads.lock();
        let settings = pads
            .get_mut(pad)
            .ok_or_else(|| EngineError::NotFound(format!("pad {pad}")))?;
        settings.pan = pan.clamp(-1.0, 1.0);
        Ok(())
    }

    // --- Triggering ---

    /// Resolves a pad's layer for the incoming velocity, builds an
    /// `ActiveSound` from the pad settings and starts it, applying the
    /// mute-group and per-pad polyphony rules.
    pub fn trigger_drum_pad(&self, pad_index: usize, velocity: f32) -> Result<()> {
        if pad_index >= PAD_COUNT {
            return Err(EngineError::InvalidArgument(format!("invalid drum pad index: {pad_index}")));
        }
        if !(0.0..=1.0).contains(&velocity) {
            return Err(EngineError::InvalidArgument(format!("invalid velocity: {velocity}")));
        }

        let key = pad_key(pad_index);
        let sample_rate = self.stream_sample_rate();
        let tempo = self.tempo();

        // Resolve the layer under the pad lock (Cycle mutates the index)
        let (layer, pad) = {
            let mut pads = self.pads.lock();
            let settings = pads
                .get_mut(key)
                .ok_or_else(|| EngineError::NotFound(format!("pad {key}")))?;
            let layer_index = self
                .select_layer(settings, velocity)
                .ok_or_else(|| EngineError::NotFound(format!("no enabled layer on {key}")))?;
            (settings.layers[layer_index].clone(), settings.clone())
        };

        let sample = self
            .samples
            .lock()
            .get(&layer.sample_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("sample {}", layer.sample_id)))?;

        // Tuning: pad semitones/cents plus the layer offsets, and the
        // sample-rate ratio between the file and the stream
        let semitones = (pad.tuning_coarse + layer.tuning_coarse_offset) as f64
            + (pad.tuning_fine + layer.tuning_fine_offset) as f64 / 100.0;
        let rate_ratio = sample.sample_rate as f64 / sample_rate as f64;
        let playback_speed = rate_ratio * 2.0f64.powf(semitones / 12.0);

        let level_scale = 1.0 - pad.amp_envelope.velocity_to_level * (1.0 - velocity);
        let volume =
            velocity * pad.volume * db_to_linear(layer.volume_offset_db) * level_scale;
        let pan = (pad.pan + layer.pan_offset).clamp(-1.0, 1.0);

        let mut amp_env = EnvelopeGenerator::new();
        amp_env.configure(pad.amp_envelope.clone(), sample_rate, velocity);
        amp_env.trigger_on(velocity);

        let (filter, filter_settings) = match &pad.filter {
            Some(settings) if settings.enabled => {
                let mut filter = StateVariableFilter::new();
                filter.set_sample_rate(sample_rate);
                filter.configure(settings.mode, settings.cutoff_hz, settings.resonance);
                (Some(filter), Some(settings.clone()))
            }
            _ => (None, None),
        };
        let filter_env = pad.filter_envelope.as_ref().map(|settings| {
            let mut env = EnvelopeGenerator::new();
            env.configure(settings.clone(), sample_rate, velocity);
            env.trigger_on(velocity);
            env
        });
        let pitch_env = pad.pitch_envelope.as_ref().map(|settings| {
            let mut env = EnvelopeGenerator::new();
            env.configure(settings.clone(), sample_rate, velocity);
            env.trigger_on(velocity);
            env
        });

        let mut lfos: [Option<LfoGenerator>; MAX_SOUND_LFOS] = [None, None, None, None];
        {
            let mut rng = self.rng.lock();
            for (slot, settings) in lfos.iter_mut().zip(pad.lfos.iter().filter(|l| l.enabled)) {
                let mut lfo = LfoGenerator::with_seed(rng.gen());
                lfo.configure(settings.clone(), sample_rate, tempo);
                lfo.retrigger();
                *slot = Some(lfo);
            }
        }

        let sound = ActiveSound {
            sample,
            pad_index: Some(pad_index),
            playback_mode: pad.playback_mode,
            position: 0.0,
            playback_speed,
            volume,
            pan,
            mute_group: pad.mute_group,
            amp_env,
            filter,
            filter_settings,
            filter_env,
            pitch_env,
            lfos,
        };

        let mut active = self.active.lock();

        // Mute group: release every other sound in the same non-zero group
        if pad.mute_group != 0 {
            for other in active.iter_mut() {
                if other.mute_group == pad.mute_group {
                    other.release();
                }
            }
        }

        // Per-pad polyphony: release the oldest still-held sound of this
        // pad once the cap is reached
        let playing = active
            .iter()
            .filter(|s| s.pad_index == Some(pad_index))
            .count();
        if playing >= pad.polyphony {
            if let Some(oldest) = active
                .iter_mut()
                .find(|s| s.pad_index == Some(pad_index) && s.amp_env.is_active())
            {
                oldest.release();
            }
        }

        if active.len() >= MAX_ACTIVE_SOUNDS {
            active.swap_remove(0);
        }
        active.push(sound);
        Ok(())
    }

    fn select_layer(&self, pad: &mut PadSettings, velocity: f32) -> Option<usize> {
        let enabled: Vec<usize> = pad
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.enabled)
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            return None;
        }
        match pad.layer_trigger_rule {
            LayerTriggerRule::Velocity => {
                let v = (velocity * 127.0).round() as u8;
                enabled
                    .iter()
                    .copied()
                    .find(|&i| {
                        let layer = &pad.layers[i];
                        layer.velocity_range_min <= v && v <= layer.velocity_range_max
                    })
                    .or(Some(enabled[0]))
            }
            LayerTriggerRule::Cycle => {
                let index = enabled[pad.current_cycle_layer_index % enabled.len()];
                pad.current_cycle_layer_index =
                    (pad.current_cycle_layer_index + 1) % enabled.len();
                Some(index)
            }
            LayerTriggerRule::Random => {
                let pick = self.rng.lock().gen_range(0..enabled.len());
                Some(enabled[pick])
            }
        }
    }

    /// Starts a simple free-running one-shot of a stored sample.
    pub fn trigger_sample(&self, sample_id: &str, volume: f32, pan: f32) -> Result<()> {
        let sample = self
            .samples
            .lock()
            .get(sample_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("sample {sample_id}")))?;
        let sound = ActiveSound::free_running(sample, volume, pan, self.stream_sample_rate());
        let mut active = self.active.lock();
        if active.len() >= MAX_ACTIVE_SOUNDS {
            active.swap_remove(0);
        }
        active.push(sound);
        Ok(())
    }

    /// Triggers release on every active sound's amp envelope.
    pub fn stop_all_samples(&self) {
        let mut active = self.active.lock();
        for sound in active.iter_mut() {
            sound.release();
        }
    }

    pub fn active_sound_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Mixes all active sounds into the interleaved output block,
    /// dropping finished sounds. Equal-power pan for stereo outputs.
    pub fn process_block(&self, output: &mut [f32], channels: usize) {
        let frames = output.len() / channels;
        let mut active = self.active.lock();

        let mut i = 0;
        while i < active.len() {
            let sound = &mut active[i];
            let mut finished = false;
            for frame in 0..frames {
                match sound.process_frame() {
                    Some((left, right)) => {
                        if channels >= 2 {
                            output[frame * channels] += left;
                            output[frame * channels + 1] += right;
                        } else {
                            output[frame] += left + right;
                        }
                    }
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if finished || sound.is_finished() {
                active.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::envelope::EnvelopeType;

    fn ramp_sample(id: &str, frames: usize, sample_rate: u32) -> Sample {
        // Deterministic, easy-to-verify content: data[i] = (i+1)/frames
        let data: Vec<f32> = (0..frames).map(|i| (i + 1) as f32 / frames as f32).collect();
        Sample {
            id: id.to_string(),
            channels: 1,
            sample_rate,
            frame_count: frames,
            data,
        }
    }

    fn instant_envelope() -> EnvelopeSettings {
        EnvelopeSettings {
            envelope_type: EnvelopeType::Adsr,
            attack_ms: 0.0,
            hold_ms: 0.0,
            decay_ms: 0.0,
            sustain_level: 1.0,
            release_ms: 0.0,
            velocity_to_attack: 0.0,
            velocity_to_level: 0.0,
        }
    }

    fn basic_pad(sample_id: &str) -> PadSettings {
        PadSettings {
            layers: vec![SampleLayer::new(sample_id)],
            amp_envelope: instant_envelope(),
            ..PadSettings::default()
        }
    }

    #[test]
    fn test_one_shot_pad_hit_renders_and_finishes() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("kick", 100, 48000));
        player.update_pad_settings(pad_key(0), basic_pad("kick"));

        player.trigger_drum_pad(0, 1.0).unwrap();
        assert_eq!(player.active_sound_count(), 1);

        let mut out = vec![0.0f32; 200 * 2];
        player.process_block(&mut out, 2);

        // First 100 frames carry the ramp scaled by center pan (0.707)
        let center = (0.5f32).sqrt();
        for frame in 0..100 {
            let expected = (frame + 1) as f32 / 100.0 * center;
            assert!(
                (out[frame * 2] - expected).abs() < 1e-4,
                "frame {frame}: {} vs {expected}",
                out[frame * 2]
            );
            assert!((out[frame * 2 + 1] - expected).abs() < 1e-4);
        }
        // Remaining frames silent; sound dropped
        for frame in 100..200 {
            assert_eq!(out[frame * 2], 0.0);
        }
        assert_eq!(player.active_sound_count(), 0);
    }

    #[test]
    fn test_pan_law_equal_power() {
        for pan in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
            let left = (0.5 * (1.0 - pan)).sqrt();
            let right = (0.5 * (1.0 + pan)).sqrt();
            assert!((left * left + right * right - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_trigger_rejects_bad_arguments() {
        let player = SamplePlayer::new(48000);
        assert!(matches!(
            player.trigger_drum_pad(16, 0.5),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            player.trigger_drum_pad(0, 1.5),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            player.trigger_drum_pad(0, 0.5),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_mute_group_releases_other_sounds() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("a", 48000, 48000));
        player.insert_sample(ramp_sample("b", 48000, 48000));

        let mut pad_a = basic_pad("a");
        pad_a.mute_group = 1;
        // Give A a long release so it stays active while releasing
        pad_a.amp_envelope.release_ms = 50.0;
        let mut pad_b = basic_pad("b");
        pad_b.mute_group = 1;

        player.update_pad_settings(pad_key(0), pad_a);
        player.update_pad_settings(pad_key(1), pad_b);

        player.trigger_drum_pad(0, 1.0).unwrap();
        // Render ~50 ms
        let mut out = vec![0.0f32; 2400 * 2];
        player.process_block(&mut out, 2);

        player.trigger_drum_pad(1, 1.0).unwrap();
        {
            let active = player.active.lock();
            let sound_a = active.iter().find(|s| s.pad_index == Some(0)).unwrap();
            assert_eq!(
                sound_a.amp_env.stage(),
                crate::audio::envelope::EnvelopeStage::Release
            );
        }
        // A's 50 ms release elapses within 3000 frames
        let mut out = vec![0.0f32; 3000 * 2];
        player.process_block(&mut out, 2);
        let active = player.active.lock();
        assert!(active.iter().all(|s| s.pad_index != Some(0)));
    }

    #[test]
    fn test_velocity_layer_selection() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("soft", 10, 48000));
        player.insert_sample(ramp_sample("loud", 10, 48000));

        let mut soft = SampleLayer::new("soft");
        soft.velocity_range_min = 0;
        soft.velocity_range_max = 63;
        let mut loud = SampleLayer::new("loud");
        loud.velocity_range_min = 64;
        loud.velocity_range_max = 127;

        let pad = PadSettings {
            layers: vec![soft, loud],
            amp_envelope: instant_envelope(),
            ..PadSettings::default()
        };
        player.update_pad_settings(pad_key(0), pad);

        player.trigger_drum_pad(0, 0.25).unwrap();
        assert_eq!(player.active.lock()[0].sample.id, "soft");
        player.trigger_drum_pad(0, 0.9).unwrap();
        assert_eq!(player.active.lock()[1].sample.id, "loud");
    }

    #[test]
    fn test_cycle_layer_selection_advances() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("x", 10, 48000));
        player.insert_sample(ramp_sample("y", 10, 48000));

        let pad = PadSettings {
            layers: vec![SampleLayer::new("x"), SampleLayer::new("y")],
            layer_trigger_rule: LayerTriggerRule::Cycle,
            amp_envelope: instant_envelope(),
            ..PadSettings::default()
        };
        player.update_pad_settings(pad_key(0), pad);

        player.trigger_drum_pad(0, 1.0).unwrap();
        player.trigger_drum_pad(0, 1.0).unwrap();
        player.trigger_drum_pad(0, 1.0).unwrap();
        let active = player.active.lock();
        assert_eq!(active[0].sample.id, "x");
        assert_eq!(active[1].sample.id, "y");
        assert_eq!(active[2].sample.id, "x");
    }

    #[test]
    fn test_update_pad_settings_resets_cycle() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("x", 10, 48000));
        let mut pad = PadSettings {
            layers: vec![SampleLayer::new("x")],
            layer_trigger_rule: LayerTriggerRule::Cycle,
            ..PadSettings::default()
        };
        pad.current_cycle_layer_index = 5;
        player.update_pad_settings(pad_key(0), pad);
        assert_eq!(
            player.pad_settings(pad_key(0)).unwrap().current_cycle_layer_index,
            0
        );
    }

    #[test]
    fn test_tuning_changes_playback_speed() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("s", 1000, 48000));
        let mut pad = basic_pad("s");
        pad.tuning_coarse = 12; // up one octave: plays twice as fast
        player.update_pad_settings(pad_key(0), pad);
        player.trigger_drum_pad(0, 1.0).unwrap();

        let mut out = vec![0.0f32; 501 * 2];
        player.process_block(&mut out, 2);
        // 1000 frames consumed at 2x speed within 501 output frames
        assert_eq!(player.active_sound_count(), 0);
    }

    #[test]
    fn test_loop_mode_wraps() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("l", 64, 48000));
        let mut pad = basic_pad("l");
        pad.playback_mode = PlaybackMode::Loop;
        player.update_pad_settings(pad_key(0), pad);
        player.trigger_drum_pad(0, 1.0).unwrap();

        let mut out = vec![0.0f32; 1024 * 2];
        player.process_block(&mut out, 2);
        // Still playing after many wraps
        assert_eq!(player.active_sound_count(), 1);
        // Output is periodic with the sample length
        let center = (0.5f32).sqrt();
        assert!((out[0] - (1.0 / 64.0) * center).abs() < 1e-4);
        assert!((out[64 * 2] - (1.0 / 64.0) * center).abs() < 1e-4);
    }

    #[test]
    fn test_stop_all_samples_releases() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("s", 48000, 48000));
        player.update_pad_settings(pad_key(0), basic_pad("s"));
        player.trigger_drum_pad(0, 1.0).unwrap();
        player.trigger_sample("s", 0.5, 0.0).unwrap();
        assert_eq!(player.active_sound_count(), 2);

        player.stop_all_samples();
        let mut out = vec![0.0f32; 1024 * 2];
        player.process_block(&mut out, 2);
        assert_eq!(player.active_sound_count(), 0);
    }

    #[test]
    fn test_unload_keeps_playing_voice_alive() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("s", 10000, 48000));
        player.update_pad_settings(pad_key(0), basic_pad("s"));
        player.trigger_drum_pad(0, 1.0).unwrap();
        player.unload_sample("s").unwrap();
        assert!(!player.is_sample_loaded("s"));

        // The active voice still holds the data through its Arc
        let mut out = vec![0.0f32; 256 * 2];
        player.process_block(&mut out, 2);
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_per_pad_polyphony_releases_oldest() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("s", 48000, 48000));
        let mut pad = basic_pad("s");
        pad.polyphony = 2;
        pad.amp_envelope.release_ms = 100.0;
        player.update_pad_settings(pad_key(0), pad);

        player.trigger_drum_pad(0, 1.0).unwrap();
        player.trigger_drum_pad(0, 1.0).unwrap();
        player.trigger_drum_pad(0, 1.0).unwrap();
        let active = player.active.lock();
        // The first sound was sent to release when the third arrived
        assert_eq!(
            active[0].amp_env.stage(),
            crate::audio::envelope::EnvelopeStage::Release
        );
    }

    #[test]
    fn test_velocity_to_level_scales_volume() {
        let player = SamplePlayer::new(48000);
        player.insert_sample(ramp_sample("s", 100, 48000));
        let mut pad = basic_pad("s");
        pad.amp_envelope.velocity_to_level = 1.0;
        player.update_pad_settings(pad_key(0), pad);
        player.trigger_drum_pad(0, 0.5).unwrap();
        // volume = vel * pad_vol * level_scale = 0.5 * 1.0 * 0.5
        let active = player.active.lock();
        assert!((active[0].volume - 0.25).abs() < 1e-6);
    }
}
