//! Tone clouds and punishment tones.
//!
//! A tone cloud is a mixture of short tones with staggered onsets. Each tone's
//! octave is drawn with probability `strength` % for the target octave and the
//! remainder split evenly between the two others; the pitch within the octave
//! is uniform over that octave's grid.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RigSettings, TaskPrefs};
use crate::error::{Result, RigError};
use crate::policy::StimulusClass;
use crate::prng::TaskRng;

/// Middle C, Hz.
pub const MIDDLE_C: f64 = 261.625565;

/// Frequency value that selects white noise instead of a sine.
pub const WHITE_NOISE: f64 = -1.0;

/// Fraction of a tone used for each of the fade-in and fade-out ramps.
const FADE_FRACTION: f64 = 0.1;

/// Equal-tempered pitch (semitones from middle C, truncated) to Hz.
pub fn pitch_to_frequency(pitch: f64) -> f64 {
    2f64.powf(pitch.trunc() / 12.0) * MIDDLE_C
}

/// Octave sampling weights `[low, middle, high]` for a target octave.
pub fn octave_weights(target: usize, strength: u8) -> [u32; 3] {
    let off = (100u32.saturating_sub(strength as u32)) / 2;
    let mut w = [off; 3];
    if let Some(slot) = w.get_mut(target) {
        *slot = strength as u32;
    }
    w
}

/// Symmetric Hann window of length `n` (same shape as numpy's `hanning`).
fn hann(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => (0..n)
            .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / (n - 1) as f64).cos())
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct ToneCloud {
    pub samples: Arc<[i16]>,
    /// Tone frequencies in mixing order, Hz.
    pub frequencies: Vec<f64>,
    pub class: StimulusClass,
    pub strength: u8,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StimulusGenerator {
    sample_rate: u32,
    tone_fs: f64,
    tone_duration: f64,
    tone_amplitude: f64,
    cloud_duration: f64,
    cloud_range: [i32; 2],
    octaves: [Vec<f64>; 3],
    punishment: (f64, f64, f64),
}

impl StimulusGenerator {
    pub fn new(settings: &RigSettings, prefs: &TaskPrefs) -> Self {
        let t = &prefs.task_prefs;
        let [low, middle, high] = prefs.octaves();
        Self {
            sample_rate: settings.base_params.tone_sampling_rate,
            tone_fs: t.tone_fs,
            tone_duration: t.tone_duration,
            tone_amplitude: t.tone_amplitude,
            cloud_duration: t.cloud_duration,
            cloud_range: t.cloud_range,
            octaves: [low.pitches(), middle.pitches(), high.pitches()],
            punishment: (
                t.punishment_sound,
                t.punishment_sound_duration,
                t.punishment_sound_amplitude,
            ),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn cloud_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cloud_duration)
    }

    /// Number of tones mixed into one cloud.
    pub fn tone_count(&self) -> usize {
        let n = self.cloud_duration * 100.0 - (self.tone_duration - 1.0 / self.tone_fs) * 100.0;
        if n > 0.0 {
            n as usize
        } else {
            0
        }
    }

    /// A single faded tone normalised to full int16 scale.
    pub fn tone(&self, frequency: f64, duration: f64, amplitude: f64, rng: &mut TaskRng) -> Vec<i16> {
        let fs = self.sample_rate as f64;
        let n = (duration * fs) as usize;
        if n == 0 {
            return Vec::new();
        }

        let mut wave: Vec<f64> = if frequency == WHITE_NOISE {
            (0..n).map(|_| amplitude * rng.next_f64()).collect()
        } else {
            let dt = if n > 1 { duration / (n - 1) as f64 } else { 0.0 };
            let fade_len = ((duration * FADE_FRACTION * fs) as usize).min(n / 2);
            let window = hann(fade_len * 2);
            (0..n)
                .map(|i| {
                    let s = amplitude * (2.0 * PI * frequency * i as f64 * dt).sin();
                    let w = if i < fade_len {
                        window[i]
                    } else if i >= n - fade_len {
                        window[fade_len + (i - (n - fade_len))]
                    } else {
                        1.0
                    };
                    s * w
                })
                .collect()
        };

        let peak = wave.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if peak == 0.0 {
            return vec![0; n];
        }
        let scale = i16::MAX as f64 / peak;
        for v in wave.iter_mut() {
            *v *= scale;
        }
        wave.into_iter().map(|v| v as i16).collect()
    }

    pub fn punishment(&self, rng: &mut TaskRng) -> Vec<i16> {
        let (freq, dur, amp) = self.punishment;
        self.tone(freq, dur, amp, rng)
    }

    /// Build one tone cloud. This is the slow step of a trial.
    pub fn tone_cloud(&self, class: StimulusClass, strength: u8, rng: &mut TaskRng) -> Result<ToneCloud> {
        if strength > 100 {
            return Err(RigError::Stimulus(format!("strength {strength} is not a percentage")));
        }
        let n = self.tone_count();
        if n == 0 {
            return Err(RigError::Stimulus(
                "cloud_duration too short for a single tone".into(),
            ));
        }
        let weights = octave_weights(class.target_octave(), strength);

        let mut frequencies = Vec::with_capacity(n);
        for _ in 0..n {
            let octave = rng
                .weighted(&weights)
                .ok_or_else(|| RigError::Stimulus(format!("no octave weight for strength {strength}")))?;
            let grid = &self.octaves[octave];
            if grid.is_empty() {
                return Err(RigError::Stimulus(format!("octave {octave} has no pitches")));
            }
            frequencies.push(pitch_to_frequency(grid[rng.index(grid.len())]));
        }

        let fs = self.sample_rate as f64;
        let cloud_len = (fs * self.cloud_duration) as usize;
        let step = (cloud_len as f64 / ((self.tone_duration - 1.0 / self.tone_fs) * 100.0 + n as f64)) as usize;

        let mut mix = vec![0.0f64; cloud_len];
        let mut onset = 0usize;
        for &freq in &frequencies {
            let tone = self.tone(freq, self.tone_duration, self.tone_amplitude, rng);
            for (slot, s) in mix.iter_mut().skip(onset).zip(tone.iter()) {
                *slot += *s as f64;
            }
            onset += step;
        }

        let divisor = n as f64;
        for v in mix.iter_mut() {
            *v = (*v / divisor).floor();
        }

        let (lo, hi) = (self.cloud_range[0] as f64, self.cloud_range[1] as f64);
        let min = mix.iter().copied().fold(f64::INFINITY, f64::min);
        let max = mix.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let samples: Vec<i16> = if max > min {
            mix.iter()
                .map(|v| ((v - min) / (max - min) * (hi - lo) + lo) as i16)
                .collect()
        } else {
            vec![lo as i16; cloud_len]
        };

        Ok(ToneCloud {
            samples: samples.into(),
            frequencies,
            class,
            strength,
            duration: self.cloud_duration(),
        })
    }
}
