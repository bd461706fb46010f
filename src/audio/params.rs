//! Thread-safe plugin parameters
//!
//! A parameter is a named, typed, range-bounded double with an atomic
//! current value and an atomic modulation offset. Reads from the audio
//! thread are wait-free: values are stored as f64 bit patterns in
//! `AtomicU64`, the same trick the engine uses for f32 level metering.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Helper to store f64 in AtomicU64
#[inline]
fn f64_to_u64(f: f64) -> u64 {
    f.to_bits()
}

/// Helper to load f64 from AtomicU64
#[inline]
fn u64_to_f64(u: u64) -> f64 {
    f64::from_bits(u)
}

/// Parameter value types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    /// Continuous values
    Float,
    /// Discrete values
    Int,
    /// On/Off switches
    Bool,
    /// Enumerated selections
    Choice,
    /// Text input
    String,
}

/// Parameter categories (for organizing in a host UI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterCategory {
    /// Audio routing and format
    AudioIo,
    /// User-controllable parameters
    Control,
    /// Internal plugin state
    State,
    /// LFO/envelope targets
    Modulation,
}

/// Touch-optimized parameter hints (bitfield)
pub mod hints {
    pub const NONE: u32 = 0;
    /// Frequency and gain parameters map logarithmically
    pub const LOGARITHMIC: u32 = 1 << 0;
    /// -1.0 to +1.0 range
    pub const BIPOLAR: u32 = 1 << 1;
    /// 2D touch control
    pub const GESTURE_XY: u32 = 1 << 2;
    /// Rotary gesture
    pub const GESTURE_CIRCULAR: u32 = 1 << 3;
    /// Can be automated
    pub const AUTOMATABLE: u32 = 1 << 4;
    /// Safe to set from the audio thread
    pub const REALTIME_SAFE: u32 = 1 << 5;
}

/// Formats a raw value for display.
pub type ValueFormatter = Arc<dyn Fn(f64) -> String + Send + Sync>;

/// Static description of a parameter.
#[derive(Clone)]
pub struct ParameterInfo {
    /// Unique identifier within a parameter set
    pub id: String,
    /// User-visible name
    pub display_name: String,
    /// "Hz", "dB", "%", etc.
    pub units: String,
    pub param_type: ParameterType,
    pub category: ParameterCategory,
    /// Bitfield of `hints::*`
    pub hints: u32,
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
    /// 0.0 = continuous
    pub step_size: f64,
    /// Decimal places for default float formatting
    pub precision: usize,
    /// Custom display formatting; falls back to type defaults when absent
    pub formatter: Option<ValueFormatter>,
}

impl std::fmt::Debug for ParameterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterInfo")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("min_value", &self.min_value)
            .field("max_value", &self.max_value)
            .field("default_value", &self.default_value)
            .finish()
    }
}

impl ParameterInfo {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        units: impl Into<String>,
        param_type: ParameterType,
        category: ParameterCategory,
        min_value: f64,
        max_value: f64,
        default_value: f64,
        hints: u32,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            units: units.into(),
            param_type,
            category,
            hints,
            min_value,
            max_value,
            default_value,
            step_size: 0.0,
            precision: 2,
            formatter: None,
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step_size = step;
        self
    }

    pub fn with_formatter(mut self, formatter: ValueFormatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    fn has_hint(&self, hint: u32) -> bool {
        self.hints & hint != 0
    }
}

/// A single parameter with lock-free value access.
pub struct Parameter {
    info: ParameterInfo,
    value_bits: AtomicU64,
    modulation_bits: AtomicU64,
}

impl Parameter {
    pub fn new(info: ParameterInfo) -> Result<Self> {
        if info.min_value >= info.max_value {
            return Err(EngineError::InvalidArgument(format!(
                "parameter '{}': min {} must be less than max {}",
                info.id, info.min_value, info.max_value
            )));
        }
        let default = info.default_value.clamp(info.min_value, info.max_value);
        Ok(Self {
            value_bits: AtomicU64::new(f64_to_u64(default)),
            modulation_bits: AtomicU64::new(f64_to_u64(0.0)),
            info,
        })
    }

    pub fn info(&self) -> &ParameterInfo {
        &self.info
    }

    /// Current value with modulation applied, clamped to the parameter range.
    /// Safe from the audio thread, never blocking.
    pub fn get(&self) -> f64 {
        let base = u64_to_f64(self.value_bits.load(Ordering::Relaxed));
        let modulation = u64_to_f64(self.modulation_bits.load(Ordering::Relaxed));
        (base + modulation).clamp(self.info.min_value, self.info.max_value)
    }

    /// Stores a new raw value, clamped to the parameter range.
    pub fn set(&self, value: f64) {
        let clamped = value.clamp(self.info.min_value, self.info.max_value);
        self.value_bits.store(f64_to_u64(clamped), Ordering::Relaxed);
    }

    /// Sets from a normalized [0,1] value, linear or logarithmic per hints.
    pub fn set_normalized(&self, normalized: f64) {
        let clamped = normalized.clamp(0.0, 1.0);
        self.set(self.denormalize(clamped));
    }

    pub fn get_normalized(&self) -> f64 {
        self.normalize(self.get())
    }

    /// Installs a modulation offset added to the raw value on `get`.
    pub fn add_modulation(&self, offset: f64) {
        self.modulation_bits.store(f64_to_u64(offset), Ordering::Relaxed);
    }

    pub fn clear_modulation(&self) {
        self.modulation_bits.store(f64_to_u64(0.0), Ordering::Relaxed);
    }

    /// Formats the current value using the custom formatter when present,
    /// otherwise type defaults: booleans as On/Off, ints as integers,
    /// floats with fixed precision and units.
    pub fn display(&self) -> String {
        let value = self.get();
        if let Some(formatter) = &self.info.formatter {
            return formatter(value);
        }
        match self.info.param_type {
            ParameterType::Bool => {
                if value > 0.5 { "On".to_string() } else { "Off".to_string() }
            }
            ParameterType::Int | ParameterType::Choice => format!("{}", value as i64),
            _ => {
                if self.info.units.is_empty() {
                    format!("{:.*}", self.info.precision, value)
                } else {
                    format!("{:.*} {}", self.info.precision, value, self.info.units)
                }
            }
        }
    }

    fn normalize(&self, raw: f64) -> f64 {
        if self.info.has_hint(hints::LOGARITHMIC) {
            let log_min = self.info.min_value.max(1e-3).ln();
            let log_max = self.info.max_value.ln();
            let log_value = raw.max(1e-3).ln();
            (log_value - log_min) / (log_max - log_min)
        } else {
            (raw - self.info.min_value) / (self.info.max_value - self.info.min_value)
        }
    }

    fn denormalize(&self, normalized: f64) -> f64 {
        if self.info.has_hint(hints::LOGARITHMIC) {
            let log_min = self.info.min_value.max(1e-3).ln();
            let log_max = self.info.max_value.ln();
            (log_min + normalized * (log_max - log_min)).exp()
        } else {
            self.info.min_value + normalized * (self.info.max_value - self.info.min_value)
        }
    }
}

/// A normalized parameter change, positioned within an audio block.
#[derive(Debug, Clone, Copy)]
pub struct ParameterChange {
    /// Stable index into the owning parameter set
    pub index: usize,
    pub normalized_value: f64,
    /// Sample position within the block at which to apply the change
    pub sample_offset: u32,
}

/// Owns parameters by stable index and by string id.
#[derive(Default)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
    index_by_id: HashMap<String, usize>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter; ids must be unique within the set.
    pub fn register(&mut self, info: ParameterInfo) -> Result<usize> {
        if self.index_by_id.contains_key(&info.id) {
            return Err(EngineError::InvalidArgument(format!(
                "parameter id already registered: {}",
                info.id
            )));
        }
        let parameter = Parameter::new(info)?;
        let index = self.parameters.len();
        self.index_by_id.insert(parameter.info.id.clone(), index);
        self.parameters.push(parameter);
        Ok(index)
    }

    pub fn get(&self, id: &str) -> Option<&Parameter> {
        self.index_by_id.get(id).map(|&i| &self.parameters[i])
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Parameter> {
        self.parameters.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn infos(&self) -> Vec<ParameterInfo> {
        self.parameters.iter().map(|p| p.info.clone()).collect()
    }

    /// Snapshot of all current values keyed by id.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.parameters
            .iter()
            .map(|p| (p.info.id.clone(), p.get()))
            .collect()
    }

    /// Restores values from a snapshot; unknown ids are skipped, values
    /// clamp to each parameter's range.
    pub fn restore(&self, values: &HashMap<String, f64>) {
        for (id, value) in values {
            if let Some(parameter) = self.get(id) {
                parameter.set(*value);
            }
        }
    }

    /// Applies queued changes. Out-of-range indices are ignored.
    pub fn apply_changes(&self, changes: &[ParameterChange]) {
        for change in changes {
            if let Some(parameter) = self.parameters.get(change.index) {
                parameter.set_normalized(change.normalized_value);
            }
        }
    }
}

/// Queue of pending parameter changes, drained by the audio callback at the
/// start of each block. The control side pushes; the render side swaps the
/// backlog into a pre-allocated vector so the drain itself never allocates.
#[derive(Default)]
pub struct ParameterChangeQueue {
    pending: Mutex<Vec<(String, ParameterChange)>>,
}

impl ParameterChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a change for the plugin with the given id.
    pub fn push(&self, plugin_id: &str, change: ParameterChange) {
        self.pending.lock().push((plugin_id.to_string(), change));
    }

    /// Moves the backlog into `out`. `out` is cleared first.
    pub fn drain_into(&self, out: &mut Vec<(String, ParameterChange)>) {
        out.clear();
        let mut pending = self.pending.lock();
        std::mem::swap(&mut *pending, out);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_param(id: &str, min: f64, max: f64, default: f64, hint_bits: u32) -> Parameter {
        Parameter::new(ParameterInfo::new(
            id,
            id,
            "",
            ParameterType::Float,
            ParameterCategory::Control,
            min,
            max,
            default,
            hint_bits,
        ))
        .unwrap()
    }

    #[test]
    fn test_set_clamps_to_range() {
        let param = float_param("volume", 0.0, 1.0, 0.5, hints::AUTOMATABLE);
        param.set(2.0);
        assert_eq!(param.get(), 1.0);
        param.set(-1.0);
        assert_eq!(param.get(), 0.0);
    }

    #[test]
    fn test_modulation_applied_and_clamped() {
        let param = float_param("pan", -1.0, 1.0, 0.0, hints::BIPOLAR);
        param.set(0.8);
        param.add_modulation(0.5);
        assert_eq!(param.get(), 1.0);
        param.clear_modulation();
        assert!((param.get() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_linear_normalized_round_trip() {
        let param = float_param("cutoff", 0.0, 10.0, 5.0, hints::NONE);
        for i in 0..=100 {
            let n = i as f64 / 100.0;
            param.set_normalized(n);
            assert!((param.get_normalized() - n).abs() < 1e-9);
        }
    }

    #[test]
    fn test_logarithmic_normalized_monotonic() {
        let param = float_param("freq", 20.0, 20000.0, 1000.0, hints::LOGARITHMIC);
        let mut last = -1.0;
        for i in 0..=50 {
            let n = i as f64 / 50.0;
            param.set_normalized(n);
            let raw = param.get();
            assert!(raw > last, "log mapping must be strictly monotonic");
            last = raw;
            // Idempotent under round-trip
            let n_back = param.get_normalized();
            param.set_normalized(n_back);
            assert!((param.get() - raw).abs() < 1e-6);
        }
        param.set_normalized(0.0);
        assert!((param.get() - 20.0).abs() < 1e-6);
        param.set_normalized(1.0);
        assert!((param.get() - 20000.0).abs() < 1e-6);
    }

    #[test]
    fn test_display_formatting() {
        let param = float_param("cutoff", 20.0, 20000.0, 1000.0, hints::NONE);
        let mut info = param.info().clone();
        info.units = "Hz".to_string();
        let param = Parameter::new(info).unwrap();
        assert_eq!(param.display(), "1000.00 Hz");

        let toggle = Parameter::new(ParameterInfo::new(
            "sync",
            "Sync",
            "",
            ParameterType::Bool,
            ParameterCategory::Control,
            0.0,
            1.0,
            1.0,
            hints::NONE,
        ))
        .unwrap();
        assert_eq!(toggle.display(), "On");
        toggle.set(0.0);
        assert_eq!(toggle.display(), "Off");
    }

    #[test]
    fn test_invalid_range_rejected() {
        let result = Parameter::new(ParameterInfo::new(
            "bad",
            "Bad",
            "",
            ParameterType::Float,
            ParameterCategory::Control,
            1.0,
            1.0,
            1.0,
            hints::NONE,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_set_registration_and_lookup() {
        let mut set = ParameterSet::new();
        let idx = set
            .register(ParameterInfo::new(
                "gain",
                "Gain",
                "dB",
                ParameterType::Float,
                ParameterCategory::Control,
                -24.0,
                24.0,
                0.0,
                hints::AUTOMATABLE,
            ))
            .unwrap();
        assert_eq!(idx, 0);
        assert!(set.get("gain").is_some());
        assert_eq!(set.index_of("gain"), Some(0));

        // Duplicate id is rejected
        let dup = set.register(ParameterInfo::new(
            "gain",
            "Gain",
            "dB",
            ParameterType::Float,
            ParameterCategory::Control,
            -24.0,
            24.0,
            0.0,
            hints::NONE,
        ));
        assert!(dup.is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut set = ParameterSet::new();
        set.register(ParameterInfo::new(
            "a",
            "A",
            "",
            ParameterType::Float,
            ParameterCategory::Control,
            0.0,
            1.0,
            0.25,
            hints::NONE,
        ))
        .unwrap();
        set.register(ParameterInfo::new(
            "b",
            "B",
            "",
            ParameterType::Float,
            ParameterCategory::Control,
            0.0,
            1.0,
            0.75,
            hints::NONE,
        ))
        .unwrap();

        let snapshot = set.snapshot();
        set.get("a").unwrap().set(0.9);
        set.get("b").unwrap().set(0.1);
        set.restore(&snapshot);
        assert!((set.get("a").unwrap().get() - 0.25).abs() < 1e-12);
        assert!((set.get("b").unwrap().get() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_change_queue_drain() {
        let queue = ParameterChangeQueue::new();
        queue.push(
            "synth",
            ParameterChange { index: 3, normalized_value: 0.5, sample_offset: 0 },
        );
        queue.push(
            "synth",
            ParameterChange { index: 4, normalized_value: 1.0, sample_offset: 128 },
        );

        let mut out = Vec::with_capacity(16);
        queue.drain_into(&mut out);
        assert_eq!(out.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(out[1].1.sample_offset, 128);
    }
}
