//! Hosted instrument plugins
//!
//! Plugins are in-process trait objects built by a name factory and owned
//! by the engine. Processing is fallible: a plugin returning an error (or
//! panicking) is skipped for that block, never aborting the stream.

pub mod preset;
pub mod synth;

use crate::audio::params::{ParameterChange, ParameterSet};
use crate::error::{EngineError, Result};

/// Static description of a plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Unique identifier (reverse domain notation)
    pub id: String,
    /// Display name
    pub name: String,
    pub vendor: String,
    pub version: String,
    /// Generates audio rather than processing it
    pub is_synth: bool,
    pub accepts_midi: bool,
}

/// Negotiated audio format handed to plugins at initialization.
#[derive(Debug, Clone, Copy)]
pub struct AudioIoConfig {
    pub sample_rate: f32,
    pub max_block_size: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl Default for AudioIoConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block_size: 512,
            input_channels: 0,
            output_channels: 2,
        }
    }
}

/// Everything a plugin needs to render one block. Output buffers are one
/// scratch `Vec<f32>` per channel, cleared by the host before the call.
pub struct ProcessContext<'a> {
    pub outputs: &'a mut [Vec<f32>],
    pub frame_count: usize,
    pub sample_rate: f32,
    /// Current tempo in BPM
    pub tempo: f64,
    /// Position in seconds since the stream started
    pub time_position: f64,
    pub is_playing: bool,
    /// Parameter changes queued for this block, with sample offsets
    pub parameter_changes: &'a [ParameterChange],
}

/// A short message delivered to a plugin.
#[derive(Debug, Clone, Copy)]
pub struct PluginMidiMessage {
    /// Full status byte
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
    /// Position within the current buffer
    pub sample_offset: u32,
}

/// An instrument or effect hosted by the engine.
pub trait Plugin: Send {
    fn info(&self) -> PluginInfo;
    fn parameters(&self) -> &ParameterSet;

    fn initialize(&mut self, config: &AudioIoConfig) -> Result<()>;
    fn shutdown(&mut self);

    /// Renders one block into the context's output buffers. An error
    /// skips the plugin for this block.
    fn process_audio(&mut self, context: &mut ProcessContext) -> Result<()>;

    fn process_midi(&mut self, _message: &PluginMidiMessage) {}

    /// Opaque state blob; see `preset::encode_state` for the portable
    /// representation.
    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, state: &[u8]) -> Result<()>;
}

/// Builds a plugin by name. Unknown names are a `NotFound` error.
pub fn create_plugin(name: &str) -> Result<Box<dyn Plugin>> {
    match name {
        "PolySynth" | synth::POLYSYNTH_PLUGIN_ID => Ok(Box::new(synth::PolySynth::new())),
        _ => Err(EngineError::NotFound(format!("unknown plugin: {name}"))),
    }
}
