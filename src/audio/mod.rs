//! Real-time drum machine / groovebox audio engine
//!
//! Provides low-latency audio rendering with:
//! - Sample playback across 16 velocity-layered drum pads
//! - A sample-accurate step trigger scheduler
//! - Musical event routing with external clock sync
//! - A polyphonic subtractive synth hosted as a plugin
//! - A BPM-driven metronome
//! - Input capture to 32-bit float WAV with metering and auto-gain

pub mod device;
pub mod engine;
pub mod envelope;
pub mod filter;
pub mod lfo;
pub mod metronome;
pub mod midi;
pub mod params;
pub mod plugin;
pub mod recorder;
pub mod samples;
pub mod sequencer;
