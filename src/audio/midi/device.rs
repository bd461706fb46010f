//! MIDI device input handling
//!
//! Provides enumeration and connection to MIDI input devices (hardware and
//! virtual). Received short messages are parsed and forwarded into the
//! engine's event router through a caller-supplied sink.

use midir::{MidiInput, MidiInputConnection};
use parking_lot::Mutex;
use std::sync::Arc;

use super::events::status;
use crate::error::{EngineError, Result};

/// Information about a MIDI input device
#[derive(Debug, Clone, serde::Serialize)]
pub struct MidiDeviceInfo {
    /// Device index (for connection)
    pub index: usize,
    /// Device name
    pub name: String,
}

/// Receives parsed short messages: `(message_type, channel, data1, data2)`.
pub type MidiSink = Arc<dyn Fn(u8, u8, u8, u8) + Send + Sync>;

/// Active MIDI input connection
struct ActiveConnection {
    /// The midir connection (must be kept alive)
    #[allow(dead_code)]
    connection: MidiInputConnection<()>,
    /// Name of connected device
    device_name: String,
    /// Last received note (shared with callback, for activity indicators)
    last_note: Arc<Mutex<Option<u8>>>,
}

/// Manages a single hardware/virtual MIDI input connection.
pub struct MidiInputManager {
    connection: Mutex<Option<ActiveConnection>>,
}

impl MidiInputManager {
    pub fn new() -> Self {
        Self { connection: Mutex::new(None) }
    }

    /// List available MIDI input devices
    pub fn list_devices(&self) -> Result<Vec<MidiDeviceInfo>> {
        let midi_in = MidiInput::new("groovelab-enumerate")
            .map_err(|e| EngineError::Device(format!("failed to create MIDI input: {e}")))?;

        let ports = midi_in.ports();
        let mut devices = Vec::with_capacity(ports.len());
        for (index, port) in ports.iter().enumerate() {
            let name = midi_in
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {index}"));
            devices.push(MidiDeviceInfo { index, name });
        }
        Ok(devices)
    }

    /// Connect to a MIDI input device by index, forwarding parsed messages
    /// into `sink`. Returns the connected device name.
    pub fn connect(&self, device_index: usize, sink: MidiSink) -> Result<String> {
        // Disconnect any existing connection first
        self.disconnect();

        let midi_in = MidiInput::new("groovelab-input")
            .map_err(|e| EngineError::Device(format!("failed to create MIDI input: {e}")))?;

        let ports = midi_in.ports();
        let port = ports
            .get(device_index)
            .ok_or_else(|| EngineError::NotFound(format!("MIDI device index {device_index}")))?;

        let device_name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| format!("Device {device_index}"));
        log::info!("connecting to MIDI device: {device_name}");

        let last_note = Arc::new(Mutex::new(None::<u8>));
        let last_note_clone = last_note.clone();

        let connection = midi_in
            .connect(
                port,
                "groovelab-midi-in",
                move |_timestamp, message, _| {
                    Self::forward_message(message, &sink, &last_note_clone);
                },
                (),
            )
            .map_err(|e| EngineError::Device(format!("failed to connect to MIDI device: {e}")))?;

        *self.connection.lock() = Some(ActiveConnection {
            connection,
            device_name: device_name.clone(),
            last_note,
        });

        log::info!("connected to MIDI device: {device_name}");
        Ok(device_name)
    }

    /// Disconnect from the current MIDI device
    pub fn disconnect(&self) {
        let mut connection = self.connection.lock();
        if let Some(active) = connection.take() {
            log::info!("disconnecting from MIDI device: {}", active.device_name);
            // Connection is dropped here, which closes the port
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn connected_device_name(&self) -> Option<String> {
        self.connection.lock().as_ref().map(|c| c.device_name.clone())
    }

    /// Last received note (for activity indicators)
    pub fn last_note(&self) -> Option<u8> {
        self.connection.lock().as_ref().and_then(|c| *c.last_note.lock())
    }

    fn forward_message(message: &[u8], sink: &MidiSink, last_note: &Arc<Mutex<Option<u8>>>) {
        if message.is_empty() {
            return;
        }

        let status_byte = message[0];
        if status_byte >= 0xF8 {
            // System realtime: clock and transport, single byte
            sink(status_byte, 0, 0, 0);
            return;
        }

        let message_type = status_byte & 0xF0;
        let channel = status_byte & 0x0F;
        match message_type {
            status::NOTE_OFF | status::NOTE_ON | status::CONTROL_CHANGE | status::PITCH_BEND => {
                if message.len() >= 3 {
                    let data1 = message[1] & 0x7F;
                    let data2 = message[2] & 0x7F;
                    if message_type == status::NOTE_ON && data2 > 0 {
                        *last_note.lock() = Some(data1);
                    }
                    sink(message_type, channel, data1, data2);
                    log::trace!(
                        "MIDI in: type=0x{message_type:02X}, ch={channel}, d1={data1}, d2={data2}"
                    );
                }
            }
            _ => {
                log::trace!("MIDI in: ignored status=0x{status_byte:02X}, len={}", message.len());
            }
        }
    }
}

impl Default for MidiInputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MidiInputManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn test_manager_creation() {
        let manager = MidiInputManager::new();
        assert!(!manager.is_connected());
        assert!(manager.connected_device_name().is_none());
    }

    #[test]
    fn test_forward_parses_channel_messages() {
        let received = Arc::new(PlMutex::new(Vec::new()));
        let sink: MidiSink = {
            let received = received.clone();
            Arc::new(move |t, c, d1, d2| received.lock().push((t, c, d1, d2)))
        };
        let last_note = Arc::new(Mutex::new(None));

        MidiInputManager::forward_message(&[0x93, 64, 100], &sink, &last_note);
        MidiInputManager::forward_message(&[0x83, 64, 0], &sink, &last_note);
        MidiInputManager::forward_message(&[0xF8], &sink, &last_note);
        // Too-short messages are dropped
        MidiInputManager::forward_message(&[0x90, 64], &sink, &last_note);

        let events = received.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], (0x90, 3, 64, 100));
        assert_eq!(events[1], (0x80, 3, 64, 0));
        assert_eq!(events[2], (0xF8, 0, 0, 0));
        assert_eq!(*last_note.lock(), Some(64));
    }
}
