//! Granular Engine
//!
//! A granular voice is a stream of short enveloped oscillator bursts
//! ("grains") around the voice's pitch. Each grain gets a random detune of
//! up to `pitch_spread` cents, and the time to the next grain is jittered
//! by `time_spread`. Grains are fire-and-forget: every grain schedules its
//! own expiry and frees its two nodes when it has finished sounding.
//!
//! Grains run into the voice's envelope, so releasing the voice fades the
//! cloud out while already-started grains finish.

use crate::backend::{Adsr, NodeId, NodeKind, Port};
use crate::config::{GranularConfig, MAX_GRAIN_SIZE_MS};
use crate::error::BackendError;
use crate::note::{detune, MAX_FREQUENCY, MIN_FREQUENCY};
use crate::scheduler::Task;
use crate::voice::{Built, Context, EngineState, GraphBuilder, Voice, VoiceId};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shortest time between two grains
const MIN_INTERVAL: f64 = 0.001;

/// Longest edge of a rectangular grain
const RECT_EDGE: f64 = 0.002;

/// Amplitude shape of a single grain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrainShape {
    /// Bell-like: 30% attack, 40% body, 30% release
    #[default]
    Gaussian,
    /// Linear up, linear down
    Triangular,
    /// Flat with short click-free edges
    Rectangular,
}

/// Envelope of one grain and when its release starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainEnvelope {
    pub adsr: Adsr,
    /// Offset from grain start at which the release is triggered
    pub release_at: f64,
}

impl GrainEnvelope {
    /// Time from grain start until the envelope is silent
    pub fn length(&self) -> f64 {
        self.release_at + self.adsr.release
    }
}

impl GrainShape {
    /// Envelope that fits exactly into `duration` seconds
    pub fn envelope(self, duration: f64) -> GrainEnvelope {
        match self {
            GrainShape::Gaussian => GrainEnvelope {
                adsr: Adsr::new(duration * 0.3, duration * 0.4, 0.5, duration * 0.3),
                release_at: duration * 0.7,
            },
            GrainShape::Triangular => GrainEnvelope {
                adsr: Adsr::new(duration * 0.5, 0.0, 1.0, duration * 0.5),
                release_at: duration * 0.5,
            },
            GrainShape::Rectangular => {
                let edge = (duration * 0.1).min(RECT_EDGE);
                GrainEnvelope {
                    adsr: Adsr::new(edge, 0.0, 1.0, edge),
                    release_at: duration - edge,
                }
            }
        }
    }
}

/// Per-voice grain bookkeeping
#[derive(Debug, Clone)]
pub struct GranularVoice {
    /// The voice envelope grains are connected into
    pub input: NodeId,
    /// Grains started over the voice's life
    pub spawned: u64,
    /// Grains still sounding
    pub in_flight: usize,
}

/// Grain length in seconds, never above the hard cap
pub fn grain_duration(config: &GranularConfig) -> f64 {
    config.grain_size.clamp(1.0, MAX_GRAIN_SIZE_MS) / 1000.0
}

/// Seconds until the next grain
pub fn next_interval<R: Rng + ?Sized>(config: &GranularConfig, rng: &mut R) -> f64 {
    let base = 1.0 / config.density.max(f64::EPSILON);
    let jitter = if config.time_spread > 0.0 {
        1.0 + config.time_spread * rng.gen_range(-1.0..=1.0)
    } else {
        1.0
    };
    (base * jitter).max(MIN_INTERVAL)
}

pub(crate) fn build(
    builder: &mut GraphBuilder<'_>,
    envelope: Adsr,
    output: NodeId,
    now: f64,
) -> Result<Built, BackendError> {
    let env = builder.add(NodeKind::Envelope(envelope))?;
    builder.connect(env, Port::signal(output))?;
    builder.trigger_attack(env, now)?;

    Ok(Built {
        engine: EngineState::Granular(GranularVoice {
            input: env,
            spawned: 0,
            in_flight: 0,
        }),
        envelopes: vec![env],
        oscillators: Vec::new(),
        release: envelope.release,
    })
}

/// Start one grain on a voice and schedule its expiry
pub(crate) fn spawn_grain(
    ctx: &mut Context<'_>,
    voice: &mut Voice,
    id: VoiceId,
) -> Result<(), BackendError> {
    let EngineState::Granular(state) = &mut voice.engine else {
        return Ok(());
    };
    let config = &ctx.config.granular;

    let cents = if config.pitch_spread > 0.0 {
        ctx.rng.gen_range(-config.pitch_spread..=config.pitch_spread)
    } else {
        0.0
    };
    let frequency = detune(voice.frequency, cents).clamp(MIN_FREQUENCY, MAX_FREQUENCY);
    let duration = grain_duration(config);
    let shape = config.grain_shape.envelope(duration);
    let now = ctx.now();

    let mut builder = GraphBuilder::new(&mut *ctx.backend);
    let oscillator = builder.add(NodeKind::oscillator(config.waveform, frequency))?;
    let envelope = builder.add(NodeKind::Envelope(shape.adsr))?;
    builder.connect(oscillator, Port::signal(envelope))?;
    builder.connect(envelope, Port::signal(state.input))?;
    builder.start(oscillator, now)?;
    builder.trigger_attack(envelope, now)?;
    builder.trigger_release(envelope, now + shape.release_at)?;
    builder.stop(oscillator, now + duration)?;
    builder.commit();

    state.spawned += 1;
    state.in_flight += 1;
    ctx.scheduler.schedule_after(
        duration,
        Task::GrainExpire {
            voice: id,
            oscillator,
            envelope,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_grain_envelopes_fit_duration() {
        for shape in [
            GrainShape::Gaussian,
            GrainShape::Triangular,
            GrainShape::Rectangular,
        ] {
            for duration in [0.005, 0.05, 0.2] {
                let env = shape.envelope(duration);
                assert_relative_eq!(env.length(), duration, epsilon = 1e-12);
                assert!(env.adsr.attack + env.adsr.decay <= env.release_at + 1e-12);
            }
        }
    }

    #[test]
    fn test_gaussian_proportions() {
        let env = GrainShape::Gaussian.envelope(0.1);
        assert_relative_eq!(env.adsr.attack, 0.03, epsilon = 1e-12);
        assert_relative_eq!(env.adsr.decay, 0.04, epsilon = 1e-12);
        assert_relative_eq!(env.adsr.release, 0.03, epsilon = 1e-12);
    }

    #[test]
    fn test_rectangular_edges_are_short() {
        let env = GrainShape::Rectangular.envelope(0.2);
        assert!(env.adsr.attack <= RECT_EDGE);
        assert!(env.adsr.release <= RECT_EDGE);
    }

    #[test]
    fn test_grain_duration_is_capped() {
        let config = GranularConfig {
            grain_size: 5000.0,
            ..Default::default()
        };
        assert_relative_eq!(grain_duration(&config), 0.2);
    }

    #[test]
    fn test_interval_jitter_bounds() {
        let config = GranularConfig {
            density: 20.0,
            time_spread: 0.3,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..1000 {
            let interval = next_interval(&config, &mut rng);
            assert!((0.05 * 0.7 - 1e-12..=0.05 * 1.3 + 1e-12).contains(&interval));
        }

        let steady = GranularConfig {
            time_spread: 0.0,
            ..config
        };
        assert_relative_eq!(next_interval(&steady, &mut rng), 0.05);
    }

    #[test]
    fn test_interval_floor() {
        let config = GranularConfig {
            density: 1.0e9,
            time_spread: 1.0,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..100 {
            assert!(next_interval(&config, &mut rng) >= MIN_INTERVAL);
        }
    }
}
