//! Sample-scheduled metronome
//!
//! Counts down samples to the next beat at the stream sample rate and
//! emits a short windowed sine burst on each beat, accented at the start
//! of the bar. When click sample ids are configured (and loaded), the
//! beat reports through the `on_beat` callback instead so the engine can
//! trigger the samples through the sample player.

const CLICK_SECONDS: f32 = 0.01;
const PRIMARY_CLICK_HZ: f32 = 1200.0;
const SECONDARY_CLICK_HZ: f32 = 800.0;
const CLICK_AMPLITUDE: f32 = 0.3;

#[derive(Debug, Clone, Default)]
pub struct MetronomeSounds {
    /// Sample id for the bar-start click
    pub primary_sample_id: Option<String>,
    /// Sample id for the other beats
    pub secondary_sample_id: Option<String>,
}

pub struct Metronome {
    enabled: bool,
    bpm: f32,
    time_sig_num: u32,
    time_sig_den: u32,
    volume: f32,
    sounds: MetronomeSounds,

    sample_rate: f32,
    frames_per_beat: u32,
    samples_until_next_beat: u32,
    current_beat_in_bar: u32,

    click_remaining: u32,
    click_length: u32,
    click_freq: f32,
    click_phase: f32,
}

impl Metronome {
    pub fn new(sample_rate: f32) -> Self {
        let mut metronome = Self {
            enabled: false,
            bpm: 120.0,
            time_sig_num: 4,
            time_sig_den: 4,
            volume: 0.8,
            sounds: MetronomeSounds::default(),
            sample_rate: if sample_rate > 0.0 { sample_rate } else { 48000.0 },
            frames_per_beat: 0,
            samples_until_next_beat: 0,
            current_beat_in_bar: 0,
            click_remaining: 0,
            click_length: 0,
            click_freq: SECONDARY_CLICK_HZ,
            click_phase: 0.0,
        };
        metronome.update_scheduling();
        metronome
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        if sample_rate > 0.0 {
            self.sample_rate = sample_rate;
            self.update_scheduling();
        }
    }

    /// Installs the metronome configuration. BPM clamps to [30, 300],
    /// the numerator to [1, 16]; the denominator must be a power of two
    /// up to 16 (invalid values fall back to 4).
    pub fn set_state(
        &mut self,
        enabled: bool,
        bpm: f32,
        time_sig_num: u32,
        time_sig_den: u32,
        sounds: MetronomeSounds,
    ) {
        let was_enabled = self.enabled;
        self.enabled = enabled;
        self.bpm = bpm.clamp(30.0, 300.0);
        self.time_sig_num = time_sig_num.clamp(1, 16);
        self.time_sig_den = match time_sig_den {
            1 | 2 | 4 | 8 | 16 => time_sig_den,
            _ => 4,
        };
        self.sounds = sounds;
        self.update_scheduling();
        if enabled && !was_enabled {
            // Restart the bar so the first click lands immediately
            self.samples_until_next_beat = 0;
            self.current_beat_in_bar = 0;
            self.click_remaining = 0;
        }
        log::info!(
            "metronome: enabled={}, bpm={}, {}/{}",
            self.enabled,
            self.bpm,
            self.time_sig_num,
            self.time_sig_den
        );
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    fn update_scheduling(&mut self) {
        // One beat is a 1/den note: quarter notes scale by 4/den
        let beat_quarters = 4.0 / self.time_sig_den as f32;
        self.frames_per_beat =
            (self.sample_rate * 60.0 / self.bpm * beat_quarters).max(1.0) as u32;
        self.click_length = (self.sample_rate * CLICK_SECONDS) as u32;
        if self.samples_until_next_beat > self.frames_per_beat {
            self.samples_until_next_beat = self.frames_per_beat;
        }
    }

    /// Mixes metronome clicks into the interleaved output block. When a
    /// beat uses a configured click sample, `on_beat` is invoked with the
    /// sample id and the metronome volume instead of synthesizing a tone.
    pub fn process_block(
        &mut self,
        output: &mut [f32],
        channels: usize,
        mut on_beat: impl FnMut(&str, f32),
    ) {
        if !self.enabled {
            return;
        }
        let frames = output.len() / channels;

        for frame in 0..frames {
            if self.samples_until_next_beat == 0 {
                let is_bar_start = self.current_beat_in_bar == 0;
                let sample_id = if is_bar_start {
                    self.sounds.primary_sample_id.as_deref()
                } else {
                    self.sounds.secondary_sample_id.as_deref()
                };
                match sample_id {
                    Some(id) => on_beat(id, self.volume),
                    None => {
                        self.click_remaining = self.click_length;
                        self.click_phase = 0.0;
                        self.click_freq = if is_bar_start {
                            PRIMARY_CLICK_HZ
                        } else {
                            SECONDARY_CLICK_HZ
                        };
                    }
                }
                self.samples_until_next_beat = self.frames_per_beat;
                self.current_beat_in_bar = (self.current_beat_in_bar + 1) % self.time_sig_num;
            }
            self.samples_until_next_beat -= 1;

            if self.click_remaining > 0 {
                let fade = self.click_remaining as f32 / self.click_length as f32;
                let value = (self.click_phase * 2.0 * std::f32::consts::PI).sin()
                    * CLICK_AMPLITUDE
                    * fade
                    * self.volume;
                self.click_phase += self.click_freq / self.sample_rate;
                if self.click_phase >= 1.0 {
                    self.click_phase -= 1.0;
                }
                self.click_remaining -= 1;

                if channels >= 2 {
                    output[frame * channels] += value;
                    output[frame * channels + 1] += value;
                } else {
                    output[frame] += value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_samples(_id: &str, _volume: f32) {}

    #[test]
    fn test_disabled_produces_silence() {
        let mut metronome = Metronome::new(48000.0);
        let mut out = vec![0.0f32; 512 * 2];
        metronome.process_block(&mut out, 2, no_samples);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_first_click_lands_at_block_start() {
        let mut metronome = Metronome::new(48000.0);
        metronome.set_state(true, 120.0, 4, 4, MetronomeSounds::default());
        let mut out = vec![0.0f32; 1024 * 2];
        metronome.process_block(&mut out, 2, no_samples);
        // 10 ms click: frames 1.. carry signal (sine starts at phase 0)
        assert!(out[2].abs() > 0.0 || out[4].abs() > 0.0);
    }

    #[test]
    fn test_beat_spacing_matches_bpm() {
        let sample_rate = 48000.0;
        let mut metronome = Metronome::new(sample_rate);
        metronome.set_state(true, 120.0, 4, 4, MetronomeSounds::default());

        // 120 BPM at 48 kHz: a beat every 24000 frames
        let frames_per_beat = 24000usize;
        let mut out = vec![0.0f32; frames_per_beat * 2 * 2];
        metronome.process_block(&mut out, 2, no_samples);

        // Second click starts right at the beat boundary
        let at_beat = &out[frames_per_beat * 2..(frames_per_beat + 100) * 2];
        assert!(at_beat.iter().any(|&s| s.abs() > 0.0));
        // Silence just before the second beat (click is only 480 frames)
        let before = &out[(frames_per_beat - 100) * 2..frames_per_beat * 2];
        assert!(before.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_clamps_state() {
        let mut metronome = Metronome::new(48000.0);
        metronome.set_state(true, 1000.0, 99, 3, MetronomeSounds::default());
        assert_eq!(metronome.bpm(), 300.0);
        assert_eq!(metronome.time_sig_num, 16);
        assert_eq!(metronome.time_sig_den, 4);
    }

    #[test]
    fn test_configured_samples_fire_callback() {
        let mut metronome = Metronome::new(48000.0);
        metronome.set_state(
            true,
            120.0,
            2,
            4,
            MetronomeSounds {
                primary_sample_id: Some("click_hi".to_string()),
                secondary_sample_id: Some("click_lo".to_string()),
            },
        );
        let mut beats = Vec::new();
        let mut out = vec![0.0f32; 24000 * 2 * 2];
        metronome.process_block(&mut out, 2, |id, _vol| beats.push(id.to_string()));
        assert_eq!(beats, vec!["click_hi".to_string(), "click_lo".to_string()]);
        // No synthesized tone when samples are configured
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_volume_scales_click() {
        let mut quiet = Metronome::new(48000.0);
        quiet.set_state(true, 120.0, 4, 4, MetronomeSounds::default());
        quiet.set_volume(0.1);
        let mut loud = Metronome::new(48000.0);
        loud.set_state(true, 120.0, 4, 4, MetronomeSounds::default());
        loud.set_volume(1.0);

        let mut out_quiet = vec![0.0f32; 480 * 2];
        let mut out_loud = vec![0.0f32; 480 * 2];
        quiet.process_block(&mut out_quiet, 2, no_samples);
        loud.process_block(&mut out_loud, 2, no_samples);

        let peak = |b: &[f32]| b.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
        assert!(peak(&out_loud) > peak(&out_quiet) * 5.0);
    }
}
