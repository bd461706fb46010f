//! Plugin presets and state blobs
//!
//! Presets are plain line-oriented text, one `key=value` per line:
//!
//! ```text
//! name=<string>
//! version=<string>
//! pluginId=<string>
//! param.<param_id>=<double>
//! ```
//!
//! Lines without `=` are ignored. On load the `pluginId` must match;
//! unknown parameter ids are skipped and values clamp to each
//! parameter's range.
//!
//! State blobs are a portable binary enumeration of
//! `(param_id_length: u32 LE, param_id bytes, value: f32 LE)` tuples.

use std::fmt::Write as _;
use std::path::Path;

use super::Plugin;
use crate::audio::params::ParameterSet;
use crate::error::{EngineError, Result};

/// Serializes a plugin's current parameter values into the preset text.
pub fn preset_to_string(plugin: &dyn Plugin, preset_name: &str) -> String {
    let info = plugin.info();
    let mut out = String::new();
    let _ = writeln!(out, "name={preset_name}");
    let _ = writeln!(out, "version={}", info.version);
    let _ = writeln!(out, "pluginId={}", info.id);
    for parameter in plugin.parameters().iter() {
        let _ = writeln!(out, "param.{}={}", parameter.info().id, parameter.get());
    }
    out
}

/// Writes a preset file.
pub fn save_preset(plugin: &dyn Plugin, preset_name: &str, path: &Path) -> Result<()> {
    std::fs::write(path, preset_to_string(plugin, preset_name))?;
    log::info!("saved preset '{preset_name}' to {}", path.display());
    Ok(())
}

/// Applies preset text to a plugin. The embedded pluginId must match.
pub fn apply_preset_string(plugin: &dyn Plugin, text: &str) -> Result<()> {
    let info = plugin.info();
    let mut plugin_id: Option<&str> = None;
    let mut values: Vec<(&str, f64)> = Vec::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "pluginId" => plugin_id = Some(value),
            _ => {
                if let Some(param_id) = key.strip_prefix("param.") {
                    if let Ok(parsed) = value.trim().parse::<f64>() {
                        values.push((param_id, parsed));
                    }
                }
            }
        }
    }

    match plugin_id {
        Some(id) if id == info.id => {}
        Some(id) => {
            return Err(EngineError::InvalidArgument(format!(
                "preset is for plugin {id}, not {}",
                info.id
            )));
        }
        None => {
            return Err(EngineError::Corrupt("preset missing pluginId".to_string()));
        }
    }

    let parameters = plugin.parameters();
    for (param_id, value) in values {
        if let Some(parameter) = parameters.get(param_id) {
            parameter.set(value);
        } else {
            log::warn!("preset references unknown parameter: {param_id}");
        }
    }
    Ok(())
}

/// Reads and applies a preset file.
pub fn load_preset(plugin: &dyn Plugin, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    apply_preset_string(plugin, &text)?;
    log::info!("loaded preset from {}", path.display());
    Ok(())
}

/// Encodes a parameter set into the portable state blob.
pub fn encode_state(parameters: &ParameterSet) -> Vec<u8> {
    let mut state = Vec::new();
    for parameter in parameters.iter() {
        let id = parameter.info().id.as_bytes();
        state.extend_from_slice(&(id.len() as u32).to_le_bytes());
        state.extend_from_slice(id);
        state.extend_from_slice(&(parameter.get() as f32).to_le_bytes());
    }
    state
}

/// Applies a state blob; unknown ids are skipped, truncated trailing
/// tuples are ignored.
pub fn apply_state(parameters: &ParameterSet, state: &[u8]) -> Result<()> {
    if state.is_empty() {
        return Err(EngineError::Corrupt("empty plugin state".to_string()));
    }
    let read_u32 = |bytes: &[u8]| {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    };
    let mut offset = 0usize;
    while offset + 8 <= state.len() {
        let id_len = read_u32(&state[offset..]) as usize;
        offset += 4;
        if offset + id_len + 4 > state.len() {
            break;
        }
        let id = match std::str::from_utf8(&state[offset..offset + id_len]) {
            Ok(id) => id,
            Err(_) => {
                return Err(EngineError::Corrupt("non-utf8 parameter id in state".to_string()));
            }
        };
        offset += id_len;
        let value = f32::from_bits(read_u32(&state[offset..]));
        offset += 4;

        if let Some(parameter) = parameters.get(id) {
            parameter.set(value as f64);
        }
    }
    Ok(())
}
