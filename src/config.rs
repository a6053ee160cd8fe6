//! Engine Configuration
//!
//! A single [`SynthConfig`] record holds the parameters of every engine. It
//! is overwritten in place by [`SynthConfig::merged`] and read by each voice
//! on its next tick, so a change never affects a computation already in
//! flight.
//!
//! Partial updates are JSON objects deep-merged into the current values.
//! Unknown keys are ignored; a value of the wrong type rejects the whole
//! update. Every numeric field is clamped into its usable range afterwards.

use crate::backend::{Adsr, FilterMode, OscillatorShape};
use crate::chaos::{ChaosSystem, ModulationMode};
use crate::error::SynthError;
use crate::gendy::Interpolation;
use crate::granular::GrainShape;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on grain length, in milliseconds
pub const MAX_GRAIN_SIZE_MS: f64 = 200.0;

/// How direct `play_note` voices share the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// Every note gets its own voice, up to `max_voices`
    #[default]
    Poly,
    /// A new note releases the previous one
    Mono,
}

/// Which voice the sequencer plays its steps with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerVoice {
    /// Oscillator → filter → envelope
    #[default]
    Subtractive,
    /// Whichever generative engine is current
    Engine,
}

/// Complete configuration of the synthesis core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Output level applied to every voice (0.0–1.0)
    pub master_volume: f64,
    /// Gain multiplier for accented notes, never below [`MIN_ACCENT_BOOST`]
    pub accent_boost: f64,
    pub max_voices: usize,
    pub voice_mode: VoiceMode,
    /// Amplitude envelope of generative engine voices
    pub envelope: Adsr,
    pub subtractive: SubtractiveConfig,
    pub granular: GranularConfig,
    pub gendy: GendyConfig,
    pub chaos: ChaosConfig,
    pub sequencer: SequencerConfig,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            master_volume: 0.7,
            accent_boost: 1.5,
            max_voices: 16,
            voice_mode: VoiceMode::Poly,
            envelope: Adsr::new(0.05, 0.3, 0.7, 0.8),
            subtractive: SubtractiveConfig::default(),
            granular: GranularConfig::default(),
            gendy: GendyConfig::default(),
            chaos: ChaosConfig::default(),
            sequencer: SequencerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtractiveConfig {
    pub waveform: OscillatorShape,
    pub filter: FilterMode,
    /// Filter cutoff in Hz
    pub cutoff: f64,
    pub resonance: f64,
    /// Cutoff multiplier on accented notes
    pub accent_cutoff: f64,
    pub envelope: Adsr,
}

impl Default for SubtractiveConfig {
    fn default() -> Self {
        Self {
            waveform: OscillatorShape::Sawtooth,
            filter: FilterMode::Lowpass,
            cutoff: 1200.0,
            resonance: 4.0,
            accent_cutoff: 1.8,
            envelope: Adsr::new(0.005, 0.15, 0.4, 0.12),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularConfig {
    /// Grain length in milliseconds (at most 200)
    pub grain_size: f64,
    /// Average grains per second
    pub density: f64,
    /// Maximum pitch deviation per grain, in cents
    pub pitch_spread: f64,
    /// Inter-grain timing jitter (0.0–1.0)
    pub time_spread: f64,
    pub grain_shape: GrainShape,
    pub waveform: OscillatorShape,
}

impl Default for GranularConfig {
    fn default() -> Self {
        Self {
            grain_size: 50.0,
            density: 20.0,
            pitch_spread: 50.0,
            time_spread: 0.3,
            grain_shape: GrainShape::Gaussian,
            waveform: OscillatorShape::Sine,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GendyConfig {
    /// Largest amplitude step of the random walk (0.0–1.0)
    pub amplitude_variation: f64,
    /// Largest duration step of the random walk (0.0–1.0)
    pub duration_variation: f64,
    /// Control points per cycle
    pub points: usize,
    pub interpolation: Interpolation,
    pub seed: u32,
}

impl Default for GendyConfig {
    fn default() -> Self {
        Self {
            amplitude_variation: 0.3,
            duration_variation: 0.3,
            points: 12,
            interpolation: Interpolation::Linear,
            seed: 12345,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub system: ChaosSystem,
    pub modulation: ModulationMode,
    /// Integration speed multiplier
    pub speed: f64,
    /// Modulation depth (0.0–1.0). FM scales it by the carrier frequency,
    /// AM by half. Ring modulation ignores it and always modulates fully.
    pub depth: f64,
    pub waveform: OscillatorShape,
    pub lorenz: LorenzParams,
    pub chua: ChuaParams,
    pub duffing: DuffingParams,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            system: ChaosSystem::Lorenz,
            modulation: ModulationMode::Fm,
            speed: 1.0,
            depth: 0.3,
            waveform: OscillatorShape::Sine,
            lorenz: LorenzParams::default(),
            chua: ChuaParams::default(),
            duffing: DuffingParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LorenzParams {
    pub sigma: f64,
    pub rho: f64,
    pub beta: f64,
}

impl Default for LorenzParams {
    fn default() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChuaParams {
    pub alpha: f64,
    pub beta: f64,
    /// Inner slope of the diode characteristic
    pub m0: f64,
    /// Outer slope of the diode characteristic
    pub m1: f64,
}

impl Default for ChuaParams {
    fn default() -> Self {
        Self {
            alpha: 15.6,
            beta: 28.0,
            m0: -1.143,
            m1: -0.714,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuffingParams {
    pub delta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub omega: f64,
}

impl Default for DuffingParams {
    fn default() -> Self {
        Self {
            delta: 0.3,
            alpha: -1.0,
            beta: 1.0,
            gamma: 0.5,
            omega: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Beats per minute (60–200)
    pub tempo: f64,
    pub velocity: f64,
    /// Fraction of a step a note sounds before its note-off
    pub gate: f64,
    /// Glide time into a slide step, in seconds
    pub slide_time: f64,
    pub voice: SequencerVoice,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            velocity: 0.8,
            gate: 0.8,
            slide_time: 0.06,
            voice: SequencerVoice::Subtractive,
        }
    }
}

/// Accented notes are always louder than plain ones
pub const MIN_ACCENT_BOOST: f64 = 1.1;

pub const MIN_TEMPO: f64 = 60.0;
pub const MAX_TEMPO: f64 = 200.0;

/// Clamp a tempo into the supported range
pub fn clamp_tempo(bpm: f64) -> f64 {
    clamp_or(bpm, MIN_TEMPO, MAX_TEMPO, SequencerConfig::default().tempo)
}

fn clamp_or(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

impl SynthConfig {
    /// Deep-merge a partial JSON object into a copy of this configuration
    pub fn merged(&self, patch: &Value) -> Result<Self, SynthError> {
        if !patch.is_object() {
            return Err(SynthError::InvalidConfig(
                "configuration update must be an object".into(),
            ));
        }
        let mut current =
            serde_json::to_value(self).map_err(|e| SynthError::InvalidConfig(e.to_string()))?;
        merge_known(&mut current, patch, "");
        let config: SynthConfig = serde_json::from_value(current)
            .map_err(|e| SynthError::InvalidConfig(e.to_string()))?;
        Ok(config.sanitized())
    }

    /// Clamp every field into its usable range
    pub fn sanitized(mut self) -> Self {
        let d = SynthConfig::default();
        self.master_volume = clamp_or(self.master_volume, 0.0, 1.0, d.master_volume);
        self.accent_boost = clamp_or(self.accent_boost, MIN_ACCENT_BOOST, 4.0, d.accent_boost);
        self.max_voices = self.max_voices.clamp(1, 64);
        self.envelope = self.envelope.sanitized();

        let s = &mut self.subtractive;
        s.cutoff = clamp_or(s.cutoff, 20.0, 20_000.0, d.subtractive.cutoff);
        s.resonance = clamp_or(s.resonance, 0.1, 30.0, d.subtractive.resonance);
        s.accent_cutoff = clamp_or(s.accent_cutoff, 1.0, 8.0, d.subtractive.accent_cutoff);
        s.envelope = s.envelope.sanitized();

        let g = &mut self.granular;
        g.grain_size = clamp_or(g.grain_size, 5.0, MAX_GRAIN_SIZE_MS, d.granular.grain_size);
        g.density = clamp_or(g.density, 1.0, 200.0, d.granular.density);
        g.pitch_spread = clamp_or(g.pitch_spread, 0.0, 2400.0, d.granular.pitch_spread);
        g.time_spread = clamp_or(g.time_spread, 0.0, 1.0, d.granular.time_spread);

        let gd = &mut self.gendy;
        gd.amplitude_variation = clamp_or(gd.amplitude_variation, 0.0, 1.0, 0.3);
        gd.duration_variation = clamp_or(gd.duration_variation, 0.0, 1.0, 0.3);
        gd.points = gd.points.clamp(3, 64);

        let c = &mut self.chaos;
        c.speed = clamp_or(c.speed, 0.1, 4.0, d.chaos.speed);
        c.depth = clamp_or(c.depth, 0.0, 1.0, d.chaos.depth);

        let q = &mut self.sequencer;
        q.tempo = clamp_tempo(q.tempo);
        q.velocity = clamp_or(q.velocity, 0.0, 1.0, d.sequencer.velocity);
        q.gate = clamp_or(q.gate, 0.05, 1.0, d.sequencer.gate);
        q.slide_time = clamp_or(q.slide_time, 0.0, 0.5, d.sequencer.slide_time);

        self
    }
}

fn merge_known(target: &mut Value, patch: &Value, path: &str) {
    let (Value::Object(target), Value::Object(patch)) = (target, patch) else {
        return;
    };
    for (key, value) in patch {
        match target.get_mut(key) {
            Some(slot) if slot.is_object() && value.is_object() => {
                merge_known(slot, value, &format!("{}{}.", path, key));
            }
            Some(slot) => *slot = value.clone(),
            None => log::debug!(target: "driftwave", "ignoring unknown config key {}{}", path, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_sane() {
        let config = SynthConfig::default();
        assert_eq!(config.clone().sanitized(), config);
    }

    #[test]
    fn test_deep_merge() {
        let config = SynthConfig::default();
        let updated = config
            .merged(&json!({
                "granular": { "density": 40.0 },
                "chaos": { "system": "duffing", "lorenz": { "rho": 30.0 } }
            }))
            .unwrap();

        assert_eq!(updated.granular.density, 40.0);
        // siblings untouched
        assert_eq!(updated.granular.grain_size, config.granular.grain_size);
        assert_eq!(updated.chaos.system, ChaosSystem::Duffing);
        assert_eq!(updated.chaos.lorenz.rho, 30.0);
        assert_eq!(updated.chaos.lorenz.sigma, 10.0);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = SynthConfig::default();
        let updated = config
            .merged(&json!({ "reverb": 0.5, "gendy": { "wobble": true, "points": 20 } }))
            .unwrap();
        assert_eq!(updated.gendy.points, 20);
        assert_eq!(updated.granular, config.granular);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let config = SynthConfig::default();
        let result = config.merged(&json!({ "granular": { "density": "lots" } }));
        assert!(matches!(result, Err(SynthError::InvalidConfig(_))));

        let result = config.merged(&json!({ "chaos": { "system": "rossler" } }));
        assert!(result.is_err());

        assert!(config.merged(&json!(42)).is_err());
    }

    #[test]
    fn test_values_are_clamped() {
        let config = SynthConfig::default()
            .merged(&json!({
                "granular": { "grain_size": 5000.0, "density": 0.0 },
                "sequencer": { "tempo": 400.0 },
                "gendy": { "points": 1 }
            }))
            .unwrap();
        assert_eq!(config.granular.grain_size, MAX_GRAIN_SIZE_MS);
        assert_eq!(config.granular.density, 1.0);
        assert_eq!(config.sequencer.tempo, MAX_TEMPO);
        assert_eq!(config.gendy.points, 3);
    }

    #[test]
    fn test_accent_boost_floor() {
        let config = SynthConfig::default()
            .merged(&json!({ "accent_boost": 1.0 }))
            .unwrap();
        assert_eq!(config.accent_boost, MIN_ACCENT_BOOST);

        let config = SynthConfig::default()
            .merged(&json!({ "accent_boost": 0.2 }))
            .unwrap();
        assert_eq!(config.accent_boost, MIN_ACCENT_BOOST);
    }

    #[test]
    fn test_tempo_clamp() {
        assert_eq!(clamp_tempo(30.0), 60.0);
        assert_eq!(clamp_tempo(140.0), 140.0);
        assert_eq!(clamp_tempo(f64::NAN), 120.0);
    }
}
