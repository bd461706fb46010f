//! groovelab: a real-time sampler/synthesizer engine for a
//! touch-controlled drum machine.
//!
//! The engine renders a stereo float stream at the device's native sample
//! rate, mixing pad-triggered sample playback, a step sequencer's
//! scheduled triggers, a metronome and hosted synth plugins, while
//! optionally capturing the input device to a 32-bit float WAV file.
//!
//! ```no_run
//! use groovelab::{AudioConfig, AudioEngine};
//!
//! let engine = AudioEngine::initialize(None, AudioConfig::default())?;
//! let handle = engine.handle();
//! handle.load_sample_to_memory("kick", "sounds/kick.wav".into(), None, None)?;
//! handle.trigger_drum_pad(0, 1.0).ok();
//! # Ok::<(), groovelab::EngineError>(())
//! ```

pub mod audio;
pub mod error;

pub use audio::device::{AudioConfig, AudioDeviceInfo};
pub use audio::engine::{AudioEngine, EngineHandle};
pub use audio::envelope::{EnvelopeSettings, EnvelopeType};
pub use audio::filter::{FilterMode, FilterSettings};
pub use audio::lfo::{LfoDestination, LfoSettings, LfoWaveform, TimeDivision};
pub use audio::midi::{MidiDeviceInfo, MidiInputManager};
pub use audio::recorder::RecordingInfo;
pub use audio::samples::{
    pad_key, LayerTriggerRule, PadSettings, PlaybackMode, SampleLayer, SampleSource,
};
pub use error::{EngineError, Result};
