//! Musical event input: short-message types, routing to pads, external
//! clock synchronisation, and hardware device input.

pub mod clock;
pub mod device;
pub mod events;
pub mod router;

pub use clock::ClockSync;
pub use device::{MidiDeviceInfo, MidiInputManager};
pub use events::{status, MidiMessage, MidiStatistics};
pub use router::{MidiAction, MidiRouter, VelocityCurve};
