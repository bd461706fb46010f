//! Main audio engine using cpal for real-time audio output
//!
//! The engine is a single owned object bracketed by `initialize` and
//! `shutdown`; control threads talk to it through a cloneable
//! `EngineHandle`. The audio callback delegates to a `RenderContext`
//! that owns pre-allocated scratch buffers and an `Arc` of the shared
//! state, so the render path is testable without a device and never
//! allocates.

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::device::{self, AudioConfig};
use super::metronome::{Metronome, MetronomeSounds};
use super::midi::device::MidiSink;
use super::midi::events::MidiStatisticsSnapshot;
use super::midi::router::{MidiAction, MidiRouter};
use super::midi::MidiMessage;
use super::params::{ParameterChange, ParameterChangeQueue, ParameterInfo};
use super::plugin::{self, preset, AudioIoConfig, Plugin, PluginMidiMessage, ProcessContext};
use super::recorder::{AudioRecorder, RecordingInfo};
use super::samples::{PadSettings, SamplePlayer, SampleSource};
use super::sequencer::{StepScheduler, TimingStatistics};
use crate::error::{EngineError, Result};

/// Largest block the render scratch buffers accommodate; plugins are
/// skipped (with a counted error) for larger device blocks.
const MAX_BLOCK_FRAMES: usize = 4096;

/// Final output samples are clamped to this ceiling after master volume.
const OUTPUT_CEILING: f32 = 0.95;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// State shared between the render thread and all control threads.
pub(crate) struct SharedState {
    master_volume_bits: AtomicU32,
    pub(crate) sample_player: SamplePlayer,
    pub(crate) scheduler: StepScheduler,
    pub(crate) router: MidiRouter,
    metronome: Mutex<Metronome>,
    plugins: Mutex<HashMap<String, Box<dyn Plugin>>>,
    plugin_errors: AtomicU64,
    param_changes: ParameterChangeQueue,
    recorder: AudioRecorder,
    epoch: Instant,
    sample_rate: u32,
    channels: usize,
    frames_processed: AtomicU64,
    is_playing: AtomicBool,
}

impl SharedState {
    pub(crate) fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            master_volume_bits: AtomicU32::new(f32_to_u32(1.0)),
            sample_player: SamplePlayer::new(sample_rate),
            scheduler: StepScheduler::new(),
            router: MidiRouter::new(),
            metronome: Mutex::new(Metronome::new(sample_rate as f32)),
            plugins: Mutex::new(HashMap::new()),
            plugin_errors: AtomicU64::new(0),
            param_changes: ParameterChangeQueue::new(),
            recorder: AudioRecorder::new(),
            epoch: Instant::now(),
            sample_rate,
            channels,
            frames_processed: AtomicU64::new(0),
            is_playing: AtomicBool::new(false),
        }
    }

    /// Microseconds since engine construction; the common clock for
    /// scheduled triggers and musical events.
    pub(crate) fn now_micros(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    fn master_volume(&self) -> f32 {
        u32_to_f32(self.master_volume_bits.load(Ordering::Relaxed))
    }

    fn set_master_volume(&self, volume: f32) {
        self.master_volume_bits
            .store(f32_to_u32(volume.clamp(0.0, 1.0)), Ordering::Relaxed);
    }

    /// Routes one short message: immediate messages dispatch now, future
    /// ones queue for the render thread.
    fn process_midi_message(
        &self,
        message_type: u8,
        channel: u8,
        data1: u8,
        data2: u8,
        timestamp_us: i64,
    ) {
        let start = self.now_micros();
        let message = MidiMessage { message_type, channel, data1, data2, timestamp_us };
        if self.router.is_immediate(&message, start) {
            let action = self.router.decode(&message);
            self.execute_action(action);
        } else {
            self.router.schedule(message);
        }
        self.router.stats.note_processed(self.now_micros() - start);
    }

    fn execute_action(&self, action: MidiAction) {
        match action {
            MidiAction::TriggerPad { pad_index, velocity } => {
                if let Err(e) = self.sample_player.trigger_drum_pad(pad_index, velocity) {
                    log::warn!("pad trigger failed: {e}");
                }
            }
            MidiAction::SetMasterVolume(volume) => self.set_master_volume(volume),
            MidiAction::ClockPulse { timestamp_us } => {
                if self.router.clock.is_sync_enabled() {
                    self.router
                        .stats
                        .clock_pulses_received
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(bpm) = self.router.clock.on_pulse(timestamp_us) {
                        self.scheduler.set_tempo(bpm);
                        self.sample_player.set_tempo(bpm);
                    }
                }
            }
            MidiAction::TransportStart => {
                self.router.clock.reset();
            }
            MidiAction::TransportStop => {
                self.sample_player.stop_all_samples();
                self.router.clock.reset();
            }
            MidiAction::TransportContinue => {}
            MidiAction::Ignore => {}
        }
    }
}

/// The render side of the engine: everything the audio callback does for
/// one block, plus the scratch it needs to do it without allocating.
pub(crate) struct RenderContext {
    shared: Arc<SharedState>,
    channels: usize,
    sample_rate: f32,
    plugin_outputs: Vec<Vec<f32>>,
    pending_changes: Vec<(String, ParameterChange)>,
    plugin_change_scratch: Vec<ParameterChange>,
}

impl RenderContext {
    pub(crate) fn new(shared: Arc<SharedState>, channels: usize, sample_rate: f32) -> Self {
        Self {
            shared,
            channels,
            sample_rate,
            plugin_outputs: (0..channels.max(2))
                .map(|_| vec![0.0f32; MAX_BLOCK_FRAMES])
                .collect(),
            pending_changes: Vec::with_capacity(64),
            plugin_change_scratch: Vec::with_capacity(64),
        }
    }

    /// Renders one interleaved output block. Runs every phase
    /// unconditionally; master volume only scales the final gain.
    pub(crate) fn process_block(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        let frames = output.len() / self.channels;
        let now = self.shared.now_micros();

        // Due scheduled musical events first, then step triggers, so both
        // kinds of queued input land before voices produce output
        let shared = Arc::clone(&self.shared);
        shared.router.drain_due(now, |action| shared.execute_action(action));
        shared.scheduler.process_due(now, |pad_index, velocity| {
            if let Err(e) = shared.sample_player.trigger_drum_pad(pad_index, velocity) {
                log::warn!("scheduled trigger failed: {e}");
            }
        });

        shared.sample_player.process_block(output, self.channels);

        {
            let mut metronome = shared.metronome.lock();
            metronome.process_block(output, self.channels, |sample_id, volume| {
                if let Err(e) = shared.sample_player.trigger_sample(sample_id, volume, 0.0) {
                    log::debug!("metronome click sample unavailable: {e}");
                }
            });
        }

        self.process_plugins(output, frames, now);

        let master = self.shared.master_volume();
        for sample in output.iter_mut() {
            *sample = (*sample * master).clamp(-OUTPUT_CEILING, OUTPUT_CEILING);
        }
        self.shared.frames_processed.fetch_add(frames as u64, Ordering::Relaxed);
    }

    fn process_plugins(&mut self, output: &mut [f32], frames: usize, _now: i64) {
        self.shared.param_changes.drain_into(&mut self.pending_changes);

        let mut plugins = self.shared.plugins.lock();
        if plugins.is_empty() {
            return;
        }
        if frames > MAX_BLOCK_FRAMES {
            self.shared.plugin_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let tempo = self.shared.scheduler.tempo() as f64;
        let time_position =
            self.shared.frames_processed.load(Ordering::Relaxed) as f64 / self.sample_rate as f64;
        let is_playing = self.shared.is_playing.load(Ordering::Relaxed);

        for (plugin_id, plugin) in plugins.iter_mut() {
            for channel in self.plugin_outputs.iter_mut() {
                channel[..frames].fill(0.0);
            }
            self.plugin_change_scratch.clear();
            for (id, change) in &self.pending_changes {
                if id == plugin_id {
                    self.plugin_change_scratch.push(*change);
                }
            }

            let mut context = ProcessContext {
                outputs: &mut self.plugin_outputs,
                frame_count: frames,
                sample_rate: self.sample_rate,
                tempo,
                time_position,
                is_playing,
                parameter_changes: &self.plugin_change_scratch,
            };

            // A failing or panicking plugin is skipped for this block,
            // never aborting the stream
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| plugin.process_audio(&mut context)));
            match outcome {
                Ok(Ok(())) => {
                    for frame in 0..frames {
                        for (channel, buffer) in
                            self.plugin_outputs.iter().take(self.channels).enumerate()
                        {
                            output[frame * self.channels + channel] += buffer[frame] * 0.5;
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.shared.plugin_errors.fetch_add(1, Ordering::Relaxed);
                    log::error!("plugin {plugin_id} processing error: {e}");
                }
                Err(_) => {
                    self.shared.plugin_errors.fetch_add(1, Ordering::Relaxed);
                    log::error!("plugin {plugin_id} panicked during processing");
                }
            }
        }
    }
}

/// Handle to control the engine from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<SharedState>,
}

impl EngineHandle {
    /// Microseconds on the engine's monotonic clock. Timestamps for
    /// `schedule_step_trigger` and `process_midi_message` use this clock.
    pub fn now_micros(&self) -> i64 {
        self.shared.now_micros()
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    // --- Master ---

    pub fn set_master_volume(&self, volume: f32) {
        self.shared.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.shared.master_volume()
    }

    // --- Samples & pads ---

    pub fn load_sample_to_memory(
        &self,
        id: &str,
        source: SampleSource,
        frame_offset: Option<u64>,
        frame_length: Option<u64>,
    ) -> Result<()> {
        self.shared
            .sample_player
            .load_sample_to_memory(id, source, frame_offset, frame_length)
    }

    pub fn unload_sample(&self, id: &str) -> Result<()> {
        self.shared.sample_player.unload_sample(id)
    }

    pub fn is_sample_loaded(&self, id: &str) -> bool {
        self.shared.sample_player.is_sample_loaded(id)
    }

    pub fn sample_rate_of(&self, id: &str) -> Result<u32> {
        self.shared.sample_player.sample_rate_of(id)
    }

    pub fn update_pad_settings(&self, pad: &str, settings: PadSettings) {
        self.shared.sample_player.update_pad_settings(pad, settings);
    }

    pub fn set_pad_volume(&self, pad: &str, volume: f32) -> Result<()> {
        self.shared.sample_player.set_pad_volume(pad, volume)
    }

    pub fn set_pad_pan(&self, pad: &str, pan: f32) -> Result<()> {
        self.shared.sample_player.set_pad_pan(pad, pan)
    }

    pub fn trigger_drum_pad(&self, pad_index: usize, velocity: f32) -> Result<()> {
        self.shared.sample_player.trigger_drum_pad(pad_index, velocity)
    }

    pub fn trigger_sample(&self, sample_id: &str, volume: f32, pan: f32) -> Result<()> {
        self.shared.sample_player.trigger_sample(sample_id, volume, pan)
    }

    pub fn stop_all_samples(&self) {
        self.shared.sample_player.stop_all_samples();
    }

    pub fn active_sound_count(&self) -> usize {
        self.shared.sample_player.active_sound_count()
    }

    // --- Sequencer ---

    pub fn schedule_step_trigger(
        &self,
        pad_index: usize,
        velocity: f32,
        timestamp_us: i64,
    ) -> Result<()> {
        self.shared.scheduler.schedule_step_trigger(pad_index, velocity, timestamp_us)
    }

    pub fn clear_scheduled_events(&self) {
        self.shared.scheduler.clear();
    }

    pub fn set_sequencer_tempo(&self, bpm: f32) {
        self.shared.scheduler.set_tempo(bpm);
        self.shared.sample_player.set_tempo(self.shared.scheduler.tempo());
    }

    pub fn timing_statistics(&self) -> TimingStatistics {
        self.shared.scheduler.statistics()
    }

    // --- Musical events ---

    pub fn process_midi_message(
        &self,
        message_type: u8,
        channel: u8,
        data1: u8,
        data2: u8,
        timestamp_us: i64,
    ) {
        self.shared
            .process_midi_message(message_type, channel, data1, data2, timestamp_us);
    }

    /// Sink suitable for `MidiInputManager::connect`: stamps incoming
    /// hardware messages with the engine clock and routes them.
    pub fn midi_sink(&self) -> MidiSink {
        let handle = self.clone();
        Arc::new(move |message_type, channel, data1, data2| {
            let now = handle.now_micros();
            handle.process_midi_message(message_type, channel, data1, data2, now);
        })
    }

    pub fn set_midi_note_mapping(&self, note: u8, channel: u8, pad_index: usize) -> Result<()> {
        self.shared.router.set_note_mapping(note, channel, pad_index)
    }

    pub fn remove_midi_note_mapping(&self, note: u8, channel: u8) -> Result<()> {
        self.shared.router.remove_note_mapping(note, channel)
    }

    pub fn set_midi_velocity_curve(&self, curve_type: i32, sensitivity: f32) -> Result<()> {
        self.shared.router.set_velocity_curve(curve_type, sensitivity)
    }

    pub fn midi_statistics(&self) -> MidiStatisticsSnapshot {
        self.shared.router.stats.snapshot()
    }

    // --- Clock sync ---

    pub fn set_midi_clock_sync_enabled(&self, enabled: bool) {
        self.shared.router.clock.set_sync_enabled(enabled);
    }

    pub fn set_external_clock_enabled(&self, enabled: bool) {
        self.shared.router.clock.set_external_enabled(enabled);
        if !enabled {
            self.shared.scheduler.set_tempo(120.0);
        }
    }

    pub fn set_clock_smoothing_factor(&self, factor: f32) {
        self.shared.router.clock.set_smoothing_factor(factor);
    }

    pub fn is_clock_stable(&self) -> bool {
        let clock = &self.shared.router.clock;
        if !clock.is_sync_enabled() || !clock.is_external_enabled() {
            return true;
        }
        clock.is_stable()
    }

    pub fn current_bpm(&self) -> f32 {
        let clock = &self.shared.router.clock;
        if clock.is_sync_enabled() && clock.is_external_enabled() {
            if clock.is_stable() {
                clock.detected_bpm()
            } else {
                120.0
            }
        } else {
            self.shared.scheduler.tempo()
        }
    }

    // --- Metronome ---

    pub fn set_metronome_state(
        &self,
        enabled: bool,
        bpm: f32,
        time_sig_num: u32,
        time_sig_den: u32,
        primary_sample_id: Option<String>,
        secondary_sample_id: Option<String>,
    ) {
        self.shared.metronome.lock().set_state(
            enabled,
            bpm,
            time_sig_num,
            time_sig_den,
            MetronomeSounds { primary_sample_id, secondary_sample_id },
        );
    }

    pub fn set_metronome_volume(&self, volume: f32) {
        self.shared.metronome.lock().set_volume(volume);
    }

    // --- Recording ---

    pub fn start_audio_recording(
        &self,
        file_path: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<()> {
        self.shared.recorder.start_recording(file_path, sample_rate, channels)
    }

    pub fn stop_audio_recording(&self) -> Result<RecordingInfo> {
        self.shared.recorder.stop_recording()
    }

    pub fn is_recording_active(&self) -> bool {
        self.shared.recorder.is_recording()
    }

    pub fn recording_level_peak(&self) -> f32 {
        self.shared.recorder.peak_level()
    }

    pub fn recording_level_rms(&self) -> f32 {
        self.shared.recorder.rms_level()
    }

    pub fn current_recording_gain(&self) -> f32 {
        self.shared.recorder.current_gain()
    }

    pub fn set_auto_gain_enabled(&self, enabled: bool) {
        self.shared.recorder.set_auto_gain_enabled(enabled);
    }

    pub fn is_auto_gain_enabled(&self) -> bool {
        self.shared.recorder.is_auto_gain_enabled()
    }

    pub fn set_target_recording_level(&self, level: f32) {
        self.shared.recorder.set_target_level(level);
    }

    // --- Plugins ---

    /// Builds a plugin by name and takes ownership under `plugin_id`.
    /// Loading an id twice is a no-op.
    pub fn load_plugin(&self, plugin_id: &str, plugin_name: &str) -> Result<()> {
        let mut plugins = self.shared.plugins.lock();
        if plugins.contains_key(plugin_id) {
            log::warn!("plugin {plugin_id} already loaded");
            return Ok(());
        }
        let mut plugin = plugin::create_plugin(plugin_name)?;
        plugin.initialize(&AudioIoConfig {
            sample_rate: self.shared.sample_rate as f32,
            max_block_size: MAX_BLOCK_FRAMES,
            input_channels: 0,
            output_channels: self.shared.channels.max(2),
        })?;
        plugins.insert(plugin_id.to_string(), plugin);
        log::info!("plugin loaded: {plugin_id}");
        Ok(())
    }

    pub fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let mut plugins = self.shared.plugins.lock();
        match plugins.remove(plugin_id) {
            Some(mut plugin) => {
                plugin.shutdown();
                log::info!("plugin unloaded: {plugin_id}");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("plugin {plugin_id}"))),
        }
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        self.shared.plugins.lock().keys().cloned().collect()
    }

    pub fn set_plugin_parameter(&self, plugin_id: &str, param_id: &str, value: f64) -> Result<()> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        let parameter = plugin
            .parameters()
            .get(param_id)
            .ok_or_else(|| EngineError::NotFound(format!("parameter {param_id}")))?;
        parameter.set(value);
        Ok(())
    }

    pub fn get_plugin_parameter(&self, plugin_id: &str, param_id: &str) -> Result<f64> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        plugin
            .parameters()
            .get(param_id)
            .map(|p| p.get())
            .ok_or_else(|| EngineError::NotFound(format!("parameter {param_id}")))
    }

    pub fn plugin_parameters(&self, plugin_id: &str) -> Result<Vec<ParameterInfo>> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        Ok(plugin.parameters().infos())
    }

    /// Queues a normalized change that the audio callback applies at its
    /// sample offset within the next block.
    pub fn queue_plugin_parameter_change(
        &self,
        plugin_id: &str,
        param_id: &str,
        normalized_value: f64,
        sample_offset: u32,
    ) -> Result<()> {
        let index = {
            let plugins = self.shared.plugins.lock();
            let plugin = plugins
                .get(plugin_id)
                .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
            plugin
                .parameters()
                .index_of(param_id)
                .ok_or_else(|| EngineError::NotFound(format!("parameter {param_id}")))?
        };
        self.shared.param_changes.push(
            plugin_id,
            ParameterChange { index, normalized_value, sample_offset },
        );
        Ok(())
    }

    pub fn send_midi_to_plugin(
        &self,
        plugin_id: &str,
        midi_status: u8,
        data1: u8,
        data2: u8,
    ) -> Result<()> {
        let mut plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        plugin.process_midi(&PluginMidiMessage {
            status: midi_status,
            data1,
            data2,
            sample_offset: 0,
        });
        Ok(())
    }

    pub fn note_on_to_plugin(&self, plugin_id: &str, note: u8, velocity: u8) -> Result<()> {
        self.send_midi_to_plugin(plugin_id, 0x90, note, velocity)
    }

    pub fn note_off_to_plugin(&self, plugin_id: &str, note: u8) -> Result<()> {
        self.send_midi_to_plugin(plugin_id, 0x80, note, 0)
    }

    pub fn save_plugin_preset(
        &self,
        plugin_id: &str,
        preset_name: &str,
        file_path: &str,
    ) -> Result<()> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        preset::save_preset(plugin.as_ref(), preset_name, std::path::Path::new(file_path))
    }

    pub fn load_plugin_preset(&self, plugin_id: &str, file_path: &str) -> Result<()> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        preset::load_preset(plugin.as_ref(), std::path::Path::new(file_path))
    }

    pub fn save_plugin_state(&self, plugin_id: &str) -> Result<Vec<u8>> {
        let plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        Ok(plugin.save_state())
    }

    pub fn load_plugin_state(&self, plugin_id: &str, state: &[u8]) -> Result<()> {
        let mut plugins = self.shared.plugins.lock();
        let plugin = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {plugin_id}")))?;
        plugin.load_state(state)
    }

    pub fn plugin_error_count(&self) -> u64 {
        self.shared.plugin_errors.load(Ordering::Relaxed)
    }
}

/// The engine: owns the output stream and everything behind it.
pub struct AudioEngine {
    _stream: cpal::Stream,
    handle: EngineHandle,
    config: AudioConfig,
}

impl AudioEngine {
    /// Opens the output device and starts rendering.
    pub fn initialize(device_name: Option<&str>, config: AudioConfig) -> Result<Self> {
        let output_device = device::get_output_device(device_name)?;
        let stream_config = device::get_output_config(&output_device, &config)?;

        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        log::info!("starting audio engine: {sample_rate} Hz, {channels} channels");

        let shared = Arc::new(SharedState::new(sample_rate, channels));
        let mut render = RenderContext::new(Arc::clone(&shared), channels, sample_rate as f32);
        let error_shared = Arc::clone(&shared);

        let stream = output_device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render.process_block(data);
                },
                move |err| {
                    error_shared.scheduler.note_buffer_underrun();
                    log::error!("audio stream error: {err}");
                },
                None,
            )
            .map_err(|e| EngineError::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::Device(format!("failed to start stream: {e}")))?;
        shared.is_playing.store(true, Ordering::Relaxed);

        log::info!("audio engine initialized");
        Ok(Self {
            _stream: stream,
            handle: EngineHandle { shared },
            config,
        })
    }

    /// Handle for control threads.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.handle.shared.sample_rate
    }

    /// Stops any active recording and closes the device.
    pub fn shutdown(self) {
        if self.handle.is_recording_active() {
            if let Err(e) = self.handle.stop_audio_recording() {
                log::error!("failed to stop recording during shutdown: {e}");
            }
        }
        self.handle.shared.is_playing.store(false, Ordering::Relaxed);
        drop(self._stream);
        log::info!("audio engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::envelope::{EnvelopeSettings, EnvelopeType};
    use crate::audio::samples::{pad_key, Sample, SampleLayer};

    const SAMPLE_RATE: u32 = 48000;

    fn offline_engine() -> (Arc<SharedState>, RenderContext, EngineHandle) {
        let shared = Arc::new(SharedState::new(SAMPLE_RATE, 2));
        let render = RenderContext::new(Arc::clone(&shared), 2, SAMPLE_RATE as f32);
        let handle = EngineHandle { shared: Arc::clone(&shared) };
        (shared, render, handle)
    }

    fn constant_sample(id: &str, frames: usize, value: f32) -> Sample {
        Sample {
            id: id.to_string(),
            channels: 1,
            sample_rate: SAMPLE_RATE,
            frame_count: frames,
            data: vec![value; frames],
        }
    }

    fn instant_pad(sample_id: &str) -> PadSettings {
        PadSettings {
            layers: vec![SampleLayer::new(sample_id)],
            amp_envelope: EnvelopeSettings {
                envelope_type: EnvelopeType::Adsr,
                attack_ms: 0.0,
                hold_ms: 0.0,
                decay_ms: 0.0,
                sustain_level: 1.0,
                release_ms: 0.0,
                velocity_to_attack: 0.0,
                velocity_to_level: 0.0,
            },
            ..PadSettings::default()
        }
    }

    struct PanickingPlugin;

    impl Plugin for PanickingPlugin {
        fn info(&self) -> plugin::PluginInfo {
            plugin::PluginInfo {
                id: "test.panic".to_string(),
                name: "Panic".to_string(),
                vendor: "test".to_string(),
                version: "0".to_string(),
                is_synth: true,
                accepts_midi: false,
            }
        }
        fn parameters(&self) -> &crate::audio::params::ParameterSet {
            static EMPTY: std::sync::OnceLock<crate::audio::params::ParameterSet> =
                std::sync::OnceLock::new();
            EMPTY.get_or_init(crate::audio::params::ParameterSet::new)
        }
        fn initialize(&mut self, _config: &AudioIoConfig) -> Result<()> {
            Ok(())
        }
        fn shutdown(&mut self) {}
        fn process_audio(&mut self, _context: &mut ProcessContext) -> Result<()> {
            panic!("plugin bug");
        }
        fn save_state(&self) -> Vec<u8> {
            Vec::new()
        }
        fn load_state(&mut self, _state: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_shot_pad_renders_then_goes_quiet() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("hit", 100, 0.5));
        handle.update_pad_settings(pad_key(0), instant_pad("hit"));
        handle.trigger_drum_pad(0, 1.0).unwrap();

        let mut out = vec![0.0f32; 200 * 2];
        render.process_block(&mut out);

        let center = (0.5f32).sqrt();
        assert!((out[0] - 0.5 * center).abs() < 1e-4);
        assert!((out[99 * 2] - 0.5 * center).abs() < 1e-4);
        assert_eq!(out[100 * 2], 0.0);
        assert_eq!(handle.active_sound_count(), 0);
    }

    #[test]
    fn test_master_volume_scales_and_clamps() {
        let (shared, mut render, handle) = offline_engine();
        // A sample way above the ceiling exercises the clamp
        shared.sample_player.insert_sample(constant_sample("loud", 64, 4.0));
        handle.update_pad_settings(pad_key(0), instant_pad("loud"));
        handle.trigger_drum_pad(0, 1.0).unwrap();

        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        assert!(out.iter().all(|&s| s.abs() <= OUTPUT_CEILING + 1e-6));
        assert!((out[0] - OUTPUT_CEILING).abs() < 1e-6);

        // Half volume brings it under the ceiling but still audible
        handle.set_master_volume(0.1);
        handle.trigger_drum_pad(0, 1.0).unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        let peak = out.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
        assert!(peak > 0.0 && peak < OUTPUT_CEILING);
    }

    #[test]
    fn test_scheduled_triggers_fire_and_count() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("s", 10, 0.1));
        handle.update_pad_settings(pad_key(3), instant_pad("s"));

        let now = handle.now_micros();
        for k in 0..4 {
            handle.schedule_step_trigger(3, 1.0, now + k).unwrap();
        }
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);

        let stats = handle.timing_statistics();
        assert_eq!(stats.total_triggers, 4);
        assert_eq!(stats.missed_triggers, 0);
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_midi_note_on_triggers_mapped_pad() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("s", 100, 0.4));
        handle.update_pad_settings(pad_key(5), instant_pad("s"));

        // Default map: note 65, channel 0 -> pad 5
        handle.process_midi_message(0x90, 0, 65, 127, 0);
        assert_eq!(handle.active_sound_count(), 1);

        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        assert!(out.iter().any(|&s| s != 0.0));
        assert_eq!(handle.midi_statistics().messages_processed, 1);
    }

    #[test]
    fn test_cc7_sets_master_volume() {
        let (_shared, _render, handle) = offline_engine();
        handle.process_midi_message(0xB0, 0, 7, 64, 0);
        assert!((handle.master_volume() - 64.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_future_message_queued_then_dispatched() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("s", 10, 0.2));
        handle.update_pad_settings(pad_key(0), instant_pad("s"));

        // 50 ms in the future: queued, not yet triggered
        let future = handle.now_micros() + 50_000;
        handle.process_midi_message(0x90, 0, 60, 100, future);
        assert_eq!(handle.active_sound_count(), 0);
        assert_eq!(handle.midi_statistics().events_scheduled, 1);

        // Render after the due time fires it
        std::thread::sleep(std::time::Duration::from_millis(60));
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_external_clock_follows_pulses() {
        let (_shared, _render, handle) = offline_engine();
        handle.set_midi_clock_sync_enabled(true);
        handle.set_external_clock_enabled(true);
        handle.set_clock_smoothing_factor(0.5);
        handle.set_sequencer_tempo(100.0);

        // 24 pulses at exactly 20 833 us: 120 BPM
        let mut t = handle.now_micros() - 600_000;
        for _ in 0..24 {
            t += 20_833;
            handle.process_midi_message(0xF8, 0, 0, 0, t);
        }
        assert!(handle.is_clock_stable());
        assert!((handle.current_bpm() - 120.0).abs() < 0.1);
        // The sequencer tempo followed the stable clock
        assert!((handle.shared.scheduler.tempo() - 120.0).abs() < 0.1);
        assert_eq!(handle.midi_statistics().clock_pulses_received, 24);
    }

    #[test]
    fn test_transport_stop_releases_samples_and_resets_clock() {
        let (shared, _render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("s", 48000, 0.3));
        handle.update_pad_settings(pad_key(0), instant_pad("s"));
        handle.trigger_drum_pad(0, 1.0).unwrap();
        handle.set_midi_clock_sync_enabled(true);

        handle.process_midi_message(0xFC, 0, 0, 0, 0);
        // Instant release envelope drops the sound on the next block
        let mut render = RenderContext::new(Arc::clone(&shared), 2, SAMPLE_RATE as f32);
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        assert_eq!(handle.active_sound_count(), 0);
        assert_eq!(shared.router.clock.pulse_count(), 0);
    }

    #[test]
    fn test_synth_plugin_end_to_end() {
        let (_shared, mut render, handle) = offline_engine();
        handle.load_plugin("synth1", "PolySynth").unwrap();
        assert_eq!(handle.loaded_plugins(), vec!["synth1".to_string()]);

        handle.note_on_to_plugin("synth1", 60, 127).unwrap();
        let mut out = vec![0.0f32; 4800 * 2];
        render.process_block(&mut out);
        let peak = out.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
        assert!(peak > 0.001, "synth should be audible, peak {peak}");

        // All-notes-off, let the release run out, then expect silence
        handle.send_midi_to_plugin("synth1", 0xB0, 123, 0).unwrap();
        let mut out = vec![0.0f32; 4800 * 2];
        render.process_block(&mut out);
        let peak = out.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
        assert!(peak < 1e-6, "expected silence after all-notes-off, got {peak}");
    }

    #[test]
    fn test_panicking_plugin_is_contained() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("s", 64, 0.3));
        handle.update_pad_settings(pad_key(0), instant_pad("s"));
        shared
            .plugins
            .lock()
            .insert("bad".to_string(), Box::new(PanickingPlugin));

        handle.trigger_drum_pad(0, 1.0).unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);

        // The block still carries the sample audio and the error counted
        assert!(out.iter().any(|&s| s != 0.0));
        assert!(handle.plugin_error_count() >= 1);
    }

    #[test]
    fn test_plugin_parameter_ops() {
        let (_shared, mut render, handle) = offline_engine();
        handle.load_plugin("synth1", "PolySynth").unwrap();

        handle.set_plugin_parameter("synth1", "filter_cutoff", 500.0).unwrap();
        assert_eq!(handle.get_plugin_parameter("synth1", "filter_cutoff").unwrap(), 500.0);

        assert!(matches!(
            handle.set_plugin_parameter("synth1", "bogus", 1.0),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            handle.set_plugin_parameter("nope", "filter_cutoff", 1.0),
            Err(EngineError::NotFound(_))
        ));

        // Queued change applies during the next rendered block
        handle
            .queue_plugin_parameter_change("synth1", "master_volume", 0.0, 0)
            .unwrap();
        let mut out = vec![0.0f32; 64 * 2];
        render.process_block(&mut out);
        assert_eq!(handle.get_plugin_parameter("synth1", "master_volume").unwrap(), 0.0);
    }

    #[test]
    fn test_unload_plugin() {
        let (_shared, _render, handle) = offline_engine();
        handle.load_plugin("synth1", "PolySynth").unwrap();
        handle.unload_plugin("synth1").unwrap();
        assert!(handle.loaded_plugins().is_empty());
        assert!(matches!(handle.unload_plugin("synth1"), Err(EngineError::NotFound(_))));
        assert!(matches!(
            handle.load_plugin("x", "NoSuchPlugin"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_metronome_clicks_in_render() {
        let (_shared, mut render, handle) = offline_engine();
        handle.set_metronome_state(true, 120.0, 4, 4, None, None);
        handle.set_metronome_volume(1.0);

        let mut out = vec![0.0f32; 1024 * 2];
        render.process_block(&mut out);
        assert!(out.iter().any(|&s| s.abs() > 0.0));
    }

    #[test]
    fn test_mute_group_across_pads_in_render() {
        let (shared, mut render, handle) = offline_engine();
        shared.sample_player.insert_sample(constant_sample("a", 48000, 0.2));
        shared.sample_player.insert_sample(constant_sample("b", 48000, 0.2));

        let mut pad_a = instant_pad("a");
        pad_a.mute_group = 1;
        pad_a.amp_envelope.release_ms = 10.0;
        let mut pad_b = instant_pad("b");
        pad_b.mute_group = 1;
        handle.update_pad_settings(pad_key(0), pad_a);
        handle.update_pad_settings(pad_key(1), pad_b);

        handle.trigger_drum_pad(0, 1.0).unwrap();
        // ~50 ms of audio
        for _ in 0..5 {
            let mut out = vec![0.0f32; 480 * 2];
            render.process_block(&mut out);
        }
        handle.trigger_drum_pad(1, 1.0).unwrap();
        // A's 10 ms release elapses within the next blocks
        for _ in 0..3 {
            let mut out = vec![0.0f32; 480 * 2];
            render.process_block(&mut out);
        }
        assert_eq!(handle.active_sound_count(), 1);
    }
}
