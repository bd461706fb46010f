//! Audio device lookup and format negotiation
//!
//! Input and output lookups share one direction-generic path: enumerate,
//! resolve by name with a default fallback, and negotiate a stream config
//! that prefers the requested format but accepts the device default.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_size: 512,
        }
    }
}

/// Which side of the duplex a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Output,
    Input,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Output => "output",
            Direction::Input => "input",
        }
    }
}

fn default_device(host: &cpal::Host, direction: Direction) -> Result<cpal::Device> {
    let device = match direction {
        Direction::Output => host.default_output_device(),
        Direction::Input => host.default_input_device(),
    };
    device.ok_or_else(|| {
        EngineError::Device(format!("no default {} device found", direction.label()))
    })
}

fn enumerate(host: &cpal::Host, direction: Direction) -> Result<Vec<cpal::Device>> {
    let devices: Box<dyn Iterator<Item = cpal::Device>> = match direction {
        Direction::Output => Box::new(host.output_devices().map_err(|e| {
            EngineError::Device(format!("failed to enumerate output devices: {e}"))
        })?),
        Direction::Input => Box::new(host.input_devices().map_err(|e| {
            EngineError::Device(format!("failed to enumerate input devices: {e}"))
        })?),
    };
    Ok(devices.collect())
}

fn list_devices(direction: Direction) -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = default_device(&host, direction)
        .ok()
        .and_then(|d| d.name().ok());
    Ok(enumerate(&host, direction)?
        .into_iter()
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDeviceInfo {
            is_default: Some(&name) == default_name.as_ref(),
            name,
        })
        .collect())
}

fn get_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => default_device(&host, direction),
        Some(wanted) => enumerate(&host, direction)?
            .into_iter()
            .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                EngineError::NotFound(format!("{} device '{wanted}'", direction.label()))
            }),
    }
}

/// The device's default config, limited to stereo.
fn fallback_config(device: &cpal::Device, direction: Direction) -> Result<cpal::StreamConfig> {
    let default_config = match direction {
        Direction::Output => device.default_output_config(),
        Direction::Input => device.default_input_config(),
    }
    .map_err(|e| {
        EngineError::Device(format!("failed to get default {} config: {e}", direction.label()))
    })?;

    Ok(cpal::StreamConfig {
        channels: default_config.channels().min(2),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn supports_rate(range: &cpal::SupportedStreamConfigRange, sample_rate: u32) -> bool {
    range.min_sample_rate().0 <= sample_rate && sample_rate <= range.max_sample_rate().0
}

/// List available output devices
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>> {
    list_devices(Direction::Output)
}

/// List available input devices
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>> {
    list_devices(Direction::Input)
}

/// Output device by name, or the default when no name is given
pub fn get_output_device(name: Option<&str>) -> Result<cpal::Device> {
    get_device(Direction::Output, name)
}

/// The default input device
pub fn get_default_input_device() -> Result<cpal::Device> {
    get_device(Direction::Input, None)
}

/// Output config preferring the requested rate, channel count and fixed
/// buffer size; falls back to the device default.
pub fn get_output_config(
    device: &cpal::Device,
    preferred: &AudioConfig,
) -> Result<cpal::StreamConfig> {
    if let Ok(mut supported) = device.supported_output_configs() {
        let fits = supported.any(|range| {
            supports_rate(&range, preferred.sample_rate) && range.channels() >= preferred.channels
        });
        if fits {
            return Ok(cpal::StreamConfig {
                channels: preferred.channels,
                sample_rate: cpal::SampleRate(preferred.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(preferred.buffer_size),
            });
        }
    }
    fallback_config(device, Direction::Output)
}

/// Input config for a device, trying the requested sample rate and
/// channel count first and falling back to the device's native format.
pub fn get_input_config_for(
    device: &cpal::Device,
    sample_rate: u32,
    channels: u16,
) -> Result<cpal::StreamConfig> {
    if let Ok(mut supported) = device.supported_input_configs() {
        let fits = supported
            .any(|range| supports_rate(&range, sample_rate) && range.channels() == channels);
        if fits {
            return Ok(cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    fallback_config(device, Direction::Input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AudioConfig::default();
        assert_eq!(config.channels, 2);
        assert_eq!(config.sample_rate, 48000);
        assert!(config.buffer_size > 0);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::Output.label(), "output");
        assert_eq!(Direction::Input.label(), "input");
    }

    #[test]
    fn test_list_devices_does_not_fail() {
        // Should not error even on machines without audio hardware,
        // though it may return an empty list
        let _ = list_output_devices();
        let _ = list_input_devices();
    }

    #[test]
    fn test_unknown_named_device_is_not_found() {
        let host = cpal::default_host();
        // Only meaningful when enumeration itself works on this machine
        if enumerate(&host, Direction::Output).is_ok() {
            let result = get_output_device(Some("no such device, surely"));
            assert!(matches!(result, Err(EngineError::NotFound(_)) | Err(EngineError::Device(_))));
        }
    }
}
