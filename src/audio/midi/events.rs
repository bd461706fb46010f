//! Short-message types and statistics

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Status nibbles / system realtime bytes the engine understands.
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PITCH_BEND: u8 = 0xE0;
    pub const CLOCK_PULSE: u8 = 0xF8;
    pub const TRANSPORT_START: u8 = 0xFA;
    pub const TRANSPORT_CONTINUE: u8 = 0xFB;
    pub const TRANSPORT_STOP: u8 = 0xFC;
}

/// A short musical event message with a delivery timestamp on the
/// engine's monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct MidiMessage {
    /// Status nibble (0x80..0xE0) or system realtime byte (0xF8..)
    pub message_type: u8,
    /// 0..15
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
    pub timestamp_us: i64,
}

impl MidiMessage {
    pub fn note_on(channel: u8, note: u8, velocity: u8, timestamp_us: i64) -> Self {
        Self { message_type: status::NOTE_ON, channel, data1: note, data2: velocity, timestamp_us }
    }

    pub fn note_off(channel: u8, note: u8, timestamp_us: i64) -> Self {
        Self { message_type: status::NOTE_OFF, channel, data1: note, data2: 0, timestamp_us }
    }
}

/// Counters read by the control side; updated lock-free.
#[derive(Default)]
pub struct MidiStatistics {
    pub messages_processed: AtomicU64,
    pub events_scheduled: AtomicU64,
    pub events_dropped: AtomicU64,
    pub clock_pulses_received: AtomicU64,
    pub total_processing_time_us: AtomicI64,
    pub max_processing_time_us: AtomicI64,
}

/// Snapshot of the MIDI statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MidiStatisticsSnapshot {
    pub messages_processed: u64,
    pub events_scheduled: u64,
    pub events_dropped: u64,
    pub clock_pulses_received: u64,
    pub total_processing_time_us: i64,
    pub max_processing_time_us: i64,
    pub avg_processing_time_us: i64,
}

impl MidiStatistics {
    pub fn snapshot(&self) -> MidiStatisticsSnapshot {
        let processed = self.messages_processed.load(Ordering::Relaxed);
        let total_time = self.total_processing_time_us.load(Ordering::Relaxed);
        MidiStatisticsSnapshot {
            messages_processed: processed,
            events_scheduled: self.events_scheduled.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            clock_pulses_received: self.clock_pulses_received.load(Ordering::Relaxed),
            total_processing_time_us: total_time,
            max_processing_time_us: self.max_processing_time_us.load(Ordering::Relaxed),
            avg_processing_time_us: if processed > 0 { total_time / processed as i64 } else { 0 },
        }
    }

    pub fn note_processed(&self, elapsed_us: i64) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.max_processing_time_us.fetch_max(elapsed_us, Ordering::Relaxed);
    }
}
