//! Musical-event router
//!
//! Maps incoming short messages to pad triggers, applies the configured
//! velocity curve, and defers future-stamped messages through a sorted
//! queue that the audio callback drains each block. Clock pulses feed the
//! external clock sync; transport messages reset it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use super::clock::ClockSync;
use super::events::{status, MidiMessage, MidiStatistics};
use crate::error::{EngineError, Result};

/// Messages stamped within this horizon are processed immediately.
const IMMEDIATE_HORIZON_US: i64 = 1_000;

/// Scheduled-event queue capacity; the oldest entry is dropped beyond it.
const MAX_QUEUED_EVENTS: usize = 1000;

#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// Velocity response mapping from 0..127 input to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityCurve {
    Linear = 0,
    Exponential = 1,
    Logarithmic = 2,
    SCurve = 3,
}

impl VelocityCurve {
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(Self::Linear),
            1 => Some(Self::Exponential),
            2 => Some(Self::Logarithmic),
            3 => Some(Self::SCurve),
            _ => None,
        }
    }
}

/// Applies a velocity curve. Edge values short-circuit: 0 maps to 0 and
/// 127 (or above) to 1; everything else clamps into [0, 1].
pub fn apply_velocity_curve(velocity: u8, curve: VelocityCurve, sensitivity: f32) -> f32 {
    if velocity == 0 {
        return 0.0;
    }
    if velocity >= 127 {
        return 1.0;
    }

    let n = velocity as f32 / 127.0;
    let s = sensitivity;
    let result = match curve {
        VelocityCurve::Linear => n * s,
        VelocityCurve::Exponential => n.powf(2.0 / s),
        VelocityCurve::Logarithmic => (1.0 + n * (s.exp() - 1.0)).ln() / s,
        VelocityCurve::SCurve => {
            let x = n * 2.0 - 1.0;
            0.5 + 0.5 * x / (1.0 + s * x.abs())
        }
    };
    result.clamp(0.0, 1.0)
}

/// What an incoming message asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum MidiAction {
    TriggerPad { pad_index: usize, velocity: f32 },
    SetMasterVolume(f32),
    ClockPulse { timestamp_us: i64 },
    TransportStart,
    TransportStop,
    TransportContinue,
    Ignore,
}

struct QueuedEvent {
    message: MidiMessage,
}

pub struct MidiRouter {
    note_mappings: Mutex<HashMap<u16, usize>>,
    velocity_curve: AtomicU8,
    velocity_sensitivity_bits: AtomicU32,
    event_queue: Mutex<Vec<QueuedEvent>>,
    pub stats: MidiStatistics,
    pub clock: ClockSync,
}

impl Default for MidiRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiRouter {
    pub fn new() -> Self {
        let router = Self {
            note_mappings: Mutex::new(HashMap::new()),
            velocity_curve: AtomicU8::new(VelocityCurve::Linear as u8),
            velocity_sensitivity_bits: AtomicU32::new(f32_to_u32(1.0)),
            event_queue: Mutex::new(Vec::with_capacity(MAX_QUEUED_EVENTS)),
            stats: MidiStatistics::default(),
            clock: ClockSync::new(),
        };
        router.initialize_default_mappings();
        router
    }

    fn mapping_key(note: u8, channel: u8) -> u16 {
        ((note as u16) << 4) | (channel as u16 & 0x0F)
    }

    /// Notes 60..75 on channel 0 map to pads 0..15 by default.
    fn initialize_default_mappings(&self) {
        let mut mappings = self.note_mappings.lock();
        for pad in 0..16usize {
            mappings.insert(Self::mapping_key(60 + pad as u8, 0), pad);
        }
    }

    pub fn set_note_mapping(&self, note: u8, channel: u8, pad_index: usize) -> Result<()> {
        if note > 127 || channel > 15 || pad_index > 15 {
            return Err(EngineError::InvalidArgument(format!(
                "invalid mapping: note={note}, channel={channel}, pad={pad_index}"
            )));
        }
        self.note_mappings
            .lock()
            .insert(Self::mapping_key(note, channel), pad_index);
        log::info!("note mapping set: note={note}, channel={channel} -> pad={pad_index}");
        Ok(())
    }

    pub fn remove_note_mapping(&self, note: u8, channel: u8) -> Result<()> {
        if note > 127 || channel > 15 {
            return Err(EngineError::InvalidArgument(format!(
                "invalid mapping: note={note}, channel={channel}"
            )));
        }
        self.note_mappings.lock().remove(&Self::mapping_key(note, channel));
        Ok(())
    }

    pub fn pad_for_note(&self, note: u8, channel: u8) -> Option<usize> {
        self.note_mappings
            .lock()
            .get(&Self::mapping_key(note, channel))
            .copied()
    }

    pub fn set_velocity_curve(&self, curve_type: i32, sensitivity: f32) -> Result<()> {
        let curve = VelocityCurve::from_index(curve_type).ok_or_else(|| {
            EngineError::InvalidArgument(format!("invalid velocity curve type: {curve_type}"))
        })?;
        if !(sensitivity > 0.0 && sensitivity <= 2.0) {
            return Err(EngineError::InvalidArgument(format!(
                "invalid velocity sensitivity: {sensitivity}"
            )));
        }
        self.velocity_curve.store(curve as u8, Ordering::Relaxed);
        self.velocity_sensitivity_bits
            .store(f32_to_u32(sensitivity), Ordering::Relaxed);
        log::info!("velocity curve set: {curve:?}, sensitivity={sensitivity}");
        Ok(())
    }

    fn current_curve(&self) -> (VelocityCurve, f32) {
        let curve = VelocityCurve::from_index(self.velocity_curve.load(Ordering::Relaxed) as i32)
            .unwrap_or(VelocityCurve::Linear);
        let sensitivity = u32_to_f32(self.velocity_sensitivity_bits.load(Ordering::Relaxed));
        (curve, sensitivity)
    }

    /// Decides whether a message is due now. Messages stamped past the
    /// 1 ms horizon are queued and false is returned.
    pub fn is_immediate(&self, message: &MidiMessage, now_us: i64) -> bool {
        message.timestamp_us <= now_us + IMMEDIATE_HORIZON_US
    }

    /// Queues a future-stamped message, keeping the queue sorted by
    /// timestamp. When the queue is full the oldest entry is dropped and
    /// counted.
    pub fn schedule(&self, message: MidiMessage) {
        let mut queue = self.event_queue.lock();
        let at = queue.partition_point(|e| e.message.timestamp_us <= message.timestamp_us);
        queue.insert(at, QueuedEvent { message });
        if queue.len() > MAX_QUEUED_EVENTS {
            queue.remove(0);
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.events_scheduled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decodes every queued message that is due into `actions`. Called by
    /// the audio callback at block start.
    pub fn drain_due(&self, now_us: i64, mut dispatch: impl FnMut(MidiAction)) {
        let mut queue = self.event_queue.lock();
        if queue.is_empty() {
            return;
        }
        let due = queue.partition_point(|e| e.message.timestamp_us <= now_us);
        for event in queue.drain(..due) {
            dispatch(self.decode(&event.message));
        }
    }

    pub fn queued_event_count(&self) -> usize {
        self.event_queue.lock().len()
    }

    /// Decodes one message into the action the engine should take.
    pub fn decode(&self, message: &MidiMessage) -> MidiAction {
        match message.message_type & 0xF0 {
            status::NOTE_ON if message.data2 > 0 => {
                match self.pad_for_note(message.data1, message.channel) {
                    Some(pad_index) => {
                        let (curve, sensitivity) = self.current_curve();
                        let velocity = apply_velocity_curve(message.data2, curve, sensitivity);
                        MidiAction::TriggerPad { pad_index, velocity }
                    }
                    None => MidiAction::Ignore,
                }
            }
            // Note-on with velocity 0 is note-off; drum hits are
            // one-shot, so note-off is a no-op for pads
            status::NOTE_ON | status::NOTE_OFF => MidiAction::Ignore,
            status::CONTROL_CHANGE => match message.data1 {
                7 => MidiAction::SetMasterVolume(message.data2 as f32 / 127.0),
                _ => MidiAction::Ignore,
            },
            0xF0 => match message.message_type {
                status::CLOCK_PULSE => MidiAction::ClockPulse { timestamp_us: message.timestamp_us },
                status::TRANSPORT_START => MidiAction::TransportStart,
                status::TRANSPORT_STOP => MidiAction::TransportStop,
                status::TRANSPORT_CONTINUE => MidiAction::TransportContinue,
                _ => MidiAction::Ignore,
            },
            _ => MidiAction::Ignore,
        }
    }
}
