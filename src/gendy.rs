//! Gendy Engine
//!
//! Dynamic stochastic synthesis: one waveform cycle is described by a set
//! of control points whose amplitudes and durations take a bounded random
//! walk. The cycle is rendered into a 2048-sample table and played by a
//! custom-waveform oscillator.
//!
//! Every 100–300 ms the voice renders a fresh cycle and crossfades to it
//! over 100 ms; the outgoing oscillator is retired once the fade is done.
//!
//! The walk draws from a 32-bit linear congruential generator, so the same
//! seed and parameters always give bit-identical tables.

use crate::backend::{Adsr, NodeId, NodeKind, Param, Port, Waveform};
use crate::config::GendyConfig;
use crate::error::BackendError;
use crate::scheduler::Task;
use crate::voice::{Built, Context, EngineState, GraphBuilder, Voice, VoiceId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Samples per rendered cycle
pub const WAVE_SIZE: usize = 2048;

/// Length of the crossfade between two generations
pub const CROSSFADE: f64 = 0.1;

/// Smallest duration a control point may shrink to
const MIN_DURATION: f64 = 0.1;

/// How values between control points are filled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    /// Smoothstep easing, rounder corners
    Cubic,
}

impl Interpolation {
    #[inline]
    fn ease(self, t: f64) -> f64 {
        match self {
            Interpolation::Linear => t,
            Interpolation::Cubic => t * t * (3.0 - 2.0 * t),
        }
    }
}

/// Numerical Recipes LCG step
#[inline]
fn lcg(state: u32) -> u32 {
    state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}

/// MurmurHash3 finalizer
#[inline]
fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// Deterministic uniform stream in [-1, 1)
///
/// The seed is hashed before the first draw. Successive generator seeds are
/// consecutive LCG states, and without the hash each cycle would replay the
/// previous cycle's draws shifted by one.
struct Walk {
    state: u32,
}

impl Walk {
    fn new(seed: u32) -> Self {
        Self { state: mix(seed) }
    }

    fn next_bipolar(&mut self) -> f64 {
        self.state = lcg(self.state);
        (self.state as f64 / 4_294_967_296.0) * 2.0 - 1.0
    }
}

/// One breakpoint of a cycle: position in [0, 1) and amplitude in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub phase: f64,
    pub amplitude: f64,
}

/// Run the random walk for one cycle
pub fn control_points(seed: u32, config: &GendyConfig) -> Vec<ControlPoint> {
    let mut walk = Walk::new(seed);
    let count = config.points.max(2);

    let mut amplitude = 0.0f64;
    let mut duration = 1.0f64;
    let mut steps = Vec::with_capacity(count);
    for _ in 0..count {
        amplitude =
            (amplitude + walk.next_bipolar() * config.amplitude_variation).clamp(-1.0, 1.0);
        duration = (duration + walk.next_bipolar() * config.duration_variation).max(MIN_DURATION);
        steps.push((amplitude, duration));
    }

    let total: f64 = steps.iter().map(|&(_, d)| d).sum();
    let mut phase = 0.0;
    steps
        .into_iter()
        .map(|(amplitude, duration)| {
            let point = ControlPoint { phase, amplitude };
            phase += duration / total;
            point
        })
        .collect()
}

/// Render control points into a single-cycle table, wrapping from the last point to the first
pub fn render(points: &[ControlPoint], interpolation: Interpolation, size: usize) -> Vec<f32> {
    if points.is_empty() {
        return vec![0.0; size];
    }
    (0..size)
        .map(|i| {
            let phase = i as f64 / size as f64;
            let k = points
                .partition_point(|p| p.phase <= phase)
                .saturating_sub(1);
            let from = points[k];
            let (to_phase, to_amp) = match points.get(k + 1) {
                Some(next) => (next.phase, next.amplitude),
                None => (1.0, points[0].amplitude),
            };
            let span = to_phase - from.phase;
            let t = if span > 0.0 {
                ((phase - from.phase) / span).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let t = interpolation.ease(t);
            (from.amplitude + (to_amp - from.amplitude) * t) as f32
        })
        .collect()
}

/// Seeded source of successive Gendy cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GendyGenerator {
    seed: u32,
}

impl GendyGenerator {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    /// Seed the next cycle will be generated from
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Render the next cycle and move on to a new seed
    pub fn generate(&mut self, config: &GendyConfig) -> Arc<[f32]> {
        let points = control_points(self.seed, config);
        self.seed = lcg(self.seed);
        render(&points, config.interpolation, WAVE_SIZE).into()
    }
}

/// Per-voice Gendy state
#[derive(Debug, Clone)]
pub struct GendyVoice {
    pub generator: GendyGenerator,
    /// Oscillator of the current generation
    pub oscillator: NodeId,
    /// Crossfade gain of the current generation
    pub fade: NodeId,
    /// Envelope every generation runs into
    pub envelope: NodeId,
    /// Table the current generation plays
    pub waveform: Arc<[f32]>,
    pub generations: u64,
}

/// Time until the next regeneration
pub fn regeneration_interval<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(0.1..=0.3)
}

pub(crate) fn build(
    builder: &mut GraphBuilder<'_>,
    config: &GendyConfig,
    envelope: Adsr,
    frequency: f64,
    output: NodeId,
    now: f64,
) -> Result<Built, BackendError> {
    let mut generator = GendyGenerator::new(config.seed);
    let waveform = generator.generate(config);

    let oscillator = builder.add(NodeKind::oscillator(
        Waveform::Custom(waveform.clone()),
        frequency,
    ))?;
    let fade = builder.add(NodeKind::gain(1.0))?;
    let env = builder.add(NodeKind::Envelope(envelope))?;
    builder.connect(oscillator, Port::signal(fade))?;
    builder.connect(fade, Port::signal(env))?;
    builder.connect(env, Port::signal(output))?;
    builder.start(oscillator, now)?;
    builder.trigger_attack(env, now)?;

    Ok(Built {
        engine: EngineState::Gendy(GendyVoice {
            generator,
            oscillator,
            fade,
            envelope: env,
            waveform,
            generations: 1,
        }),
        envelopes: vec![env],
        oscillators: vec![oscillator],
        release: envelope.release,
    })
}

/// Crossfade a voice to a freshly generated cycle
pub(crate) fn regenerate(
    ctx: &mut Context<'_>,
    voice: &mut Voice,
    id: VoiceId,
) -> Result<(), BackendError> {
    let EngineState::Gendy(state) = &mut voice.engine else {
        return Ok(());
    };
    let waveform = state.generator.generate(&ctx.config.gendy);
    let now = ctx.now();

    let mut builder = GraphBuilder::new(&mut *ctx.backend);
    let oscillator = builder.add(NodeKind::oscillator(
        Waveform::Custom(waveform.clone()),
        voice.frequency,
    ))?;
    let fade = builder.add(NodeKind::gain(0.0))?;
    builder.connect(oscillator, Port::signal(fade))?;
    builder.connect(fade, Port::signal(state.envelope))?;
    builder.start(oscillator, now)?;
    builder.ramp(fade, Param::Gain, 1.0, now, CROSSFADE)?;
    let fresh = builder.commit();

    if let Err(e) = ctx
        .backend
        .ramp_param(state.fade, Param::Gain, 0.0, now, CROSSFADE)
    {
        log::warn!(target: "driftwave", "gendy fade-out failed: {}", e);
    }

    let retired = (state.oscillator, state.fade);
    state.oscillator = oscillator;
    state.fade = fade;
    state.waveform = waveform;
    state.generations += 1;
    voice.nodes.extend(fresh);
    voice.oscillators.push(oscillator);

    ctx.scheduler.schedule_after(
        CROSSFADE,
        Task::GendyRetire {
            voice: id,
            oscillator: retired.0,
            fade: retired.1,
        },
    );
    Ok(())
}
