//! Chaos Engine
//!
//! A chaos voice is a carrier oscillator modulated by a low-frequency
//! oscillator whose rate follows a strange attractor. Every 50 ms the
//! attractor is integrated one explicit Euler step, its x coordinate is
//! squashed into [-1, 1] with `tanh`, and the modulator's frequency is
//! ramped towards `0.5 + |value| * 10` Hz.
//!
//! | System  | Equations                                                   |
//! |---------|-------------------------------------------------------------|
//! | Lorenz  | x' = σ(y − x), y' = x(ρ − z) − y, z' = xy − βz               |
//! | Chua    | x' = α(y − x − f(x)), y' = x − y + z, z' = −βy               |
//! | Duffing | x' = y, y' = −δy − αx − βx³ + γ cos(ωt)                      |
//!
//! Chua's diode is `f(x) = m1·x + ½(m0 − m1)(|x + 1| − |x − 1|)`. Duffing
//! keeps its time in `z`. A state that leaves the finite range is reset to
//! the system's initial conditions.

use crate::backend::{Adsr, AudioBackend, NodeId, NodeKind, OscillatorShape, Param, Port};
use crate::config::ChaosConfig;
use crate::error::BackendError;
use crate::voice::{Built, Context, EngineState, GraphBuilder, Voice};
use serde::{Deserialize, Serialize};

/// Time between integration steps
pub const STEP_INTERVAL: f64 = 0.05;

/// Integration step at speed 1.0
pub const BASE_DT: f64 = 0.01;

/// Ramp time for modulator rate changes
pub const RAMP_TIME: f64 = 0.05;

/// Any coordinate beyond this counts as diverged
const DIVERGENCE_LIMIT: f64 = 1.0e6;

/// Attractor driving the modulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosSystem {
    #[default]
    Lorenz,
    Chua,
    Duffing,
}

impl ChaosSystem {
    pub fn initial(self) -> (f64, f64, f64) {
        match self {
            ChaosSystem::Lorenz => (0.1, 0.0, 0.0),
            ChaosSystem::Chua => (0.7, 0.0, 0.0),
            ChaosSystem::Duffing => (1.0, 0.0, 0.0),
        }
    }

    /// Typical x excursion, used to normalize the output
    pub fn scale(self) -> f64 {
        match self {
            ChaosSystem::Lorenz => 20.0,
            ChaosSystem::Chua => 2.5,
            ChaosSystem::Duffing => 1.5,
        }
    }
}

/// How the modulator acts on the carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationMode {
    /// Modulator drives carrier frequency
    #[default]
    Fm,
    /// Modulator drives carrier amplitude around a fixed level
    Am,
    /// Carrier multiplied by the modulator
    Ring,
}

/// Integrator state of one attractor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl ChaosState {
    pub fn new(system: ChaosSystem) -> Self {
        let (x, y, z) = system.initial();
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|v| v.is_finite() && v.abs() < DIVERGENCE_LIMIT)
    }

    /// Advance by one Euler step of `dt`. Returns false if the state had to be reset.
    pub fn step(&mut self, system: ChaosSystem, config: &ChaosConfig, dt: f64) -> bool {
        let ChaosState { x, y, z } = *self;
        let (dx, dy, dz) = match system {
            ChaosSystem::Lorenz => {
                let p = &config.lorenz;
                (p.sigma * (y - x), x * (p.rho - z) - y, x * y - p.beta * z)
            }
            ChaosSystem::Chua => {
                let p = &config.chua;
                let diode = p.m1 * x + 0.5 * (p.m0 - p.m1) * ((x + 1.0).abs() - (x - 1.0).abs());
                (p.alpha * (y - x - diode), x - y + z, -p.beta * y)
            }
            ChaosSystem::Duffing => {
                let p = &config.duffing;
                let force = p.gamma * (p.omega * z).cos();
                (y, -p.delta * y - p.alpha * x - p.beta * x * x * x + force, 1.0)
            }
        };
        self.x += dx * dt;
        self.y += dy * dt;
        self.z += dz * dt;

        if self.is_finite() {
            true
        } else {
            log::debug!(target: "driftwave", "{:?} attractor diverged, resetting", system);
            *self = Self::new(system);
            false
        }
    }

    /// x squashed into [-1, 1]
    pub fn output(&self, system: ChaosSystem) -> f64 {
        let value = (self.x / system.scale()).tanh();
        if value.is_finite() {
            value
        } else {
            0.0
        }
    }
}

/// Modulator rate for an attractor output
pub fn modulator_rate(value: f64) -> f64 {
    0.5 + value.abs() * 10.0
}

/// Per-voice chaos state
#[derive(Debug, Clone)]
pub struct ChaosVoice {
    pub system: ChaosSystem,
    pub mode: ModulationMode,
    pub state: ChaosState,
    pub carrier: NodeId,
    pub modulator: NodeId,
    /// Gain scaling the modulator into its target parameter
    pub depth: NodeId,
    /// Last normalized output
    pub value: f64,
    pub steps: u64,
}

impl ChaosVoice {
    /// Gain of the depth stage for a depth and carrier frequency
    ///
    /// Ring modulation always runs at full depth.
    fn depth_gain(mode: ModulationMode, depth: f64, frequency: f64) -> f64 {
        match mode {
            ModulationMode::Fm => depth * frequency,
            ModulationMode::Am => depth * 0.5,
            ModulationMode::Ring => 1.0,
        }
    }

    /// Follow a new carrier frequency with the FM depth
    pub(crate) fn retune(
        &self,
        backend: &mut dyn AudioBackend,
        config: &ChaosConfig,
        frequency: f64,
        at: f64,
        time: f64,
    ) {
        if self.mode == ModulationMode::Fm {
            let gain = Self::depth_gain(self.mode, config.depth, frequency);
            if let Err(e) = backend.ramp_param(self.depth, Param::Gain, gain, at, time) {
                log::warn!(target: "driftwave", "chaos depth retune failed: {}", e);
            }
        }
    }
}

pub(crate) fn build(
    builder: &mut GraphBuilder<'_>,
    config: &ChaosConfig,
    envelope: Adsr,
    frequency: f64,
    output: NodeId,
    now: f64,
) -> Result<Built, BackendError> {
    let state = ChaosState::new(config.system);
    let value = state.output(config.system);
    let mode = config.modulation;

    let carrier = builder.add(NodeKind::oscillator(config.waveform, frequency))?;
    let modulator = builder.add(NodeKind::oscillator(
        OscillatorShape::Sine,
        modulator_rate(value),
    ))?;
    let depth = builder.add(NodeKind::gain(ChaosVoice::depth_gain(
        mode,
        config.depth,
        frequency,
    )))?;
    let env = builder.add(NodeKind::Envelope(envelope))?;
    builder.connect(modulator, Port::signal(depth))?;

    match mode {
        ModulationMode::Fm => {
            builder.connect(depth, Port::param(carrier, Param::Frequency))?;
            builder.connect(carrier, Port::signal(env))?;
        }
        ModulationMode::Am => {
            let vca = builder.add(NodeKind::gain(1.0 - config.depth * 0.5))?;
            builder.connect(carrier, Port::signal(vca))?;
            builder.connect(depth, Port::param(vca, Param::Gain))?;
            builder.connect(vca, Port::signal(env))?;
        }
        ModulationMode::Ring => {
            let ring = builder.add(NodeKind::gain(0.0))?;
            builder.connect(carrier, Port::signal(ring))?;
            builder.connect(depth, Port::param(ring, Param::Gain))?;
            builder.connect(ring, Port::signal(env))?;
        }
    }
    builder.connect(env, Port::signal(output))?;

    builder.start(carrier, now)?;
    builder.start(modulator, now)?;
    builder.trigger_attack(env, now)?;

    Ok(Built {
        engine: EngineState::Chaos(ChaosVoice {
            system: config.system,
            mode,
            state,
            carrier,
            modulator,
            depth,
            value,
            steps: 0,
        }),
        envelopes: vec![env],
        oscillators: vec![carrier, modulator],
        release: envelope.release,
    })
}

/// Integrate one step and retarget the modulator
///
/// System, speed, depth and constants are read from the live configuration,
/// so updates take effect on the next step.
pub(crate) fn step(ctx: &mut Context<'_>, voice: &mut Voice) {
    let EngineState::Chaos(chaos) = &mut voice.engine else {
        return;
    };
    let config = &ctx.config.chaos;
    if config.system != chaos.system {
        chaos.system = config.system;
        chaos.state = ChaosState::new(config.system);
    }

    chaos.state.step(chaos.system, config, BASE_DT * config.speed);
    chaos.value = chaos.state.output(chaos.system);
    chaos.steps += 1;

    let now = ctx.now();
    let rate = modulator_rate(chaos.value);
    if let Err(e) = ctx
        .backend
        .ramp_param(chaos.modulator, Param::Frequency, rate, now, RAMP_TIME)
    {
        log::warn!(target: "driftwave", "chaos modulator update failed: {}", e);
    }

    let depth = ChaosVoice::depth_gain(chaos.mode, config.depth, voice.frequency);
    if let Err(e) = ctx.backend.set_param(chaos.depth, Param::Gain, depth, now) {
        log::warn!(target: "driftwave", "chaos depth update failed: {}", e);
    }
}
