//! Audio Primitive Backend
//!
//! The synthesis core never renders samples itself. It builds and tears down
//! small processing graphs through the [`AudioBackend`] trait: oscillators,
//! filters, envelopes and gain stages, a shared master bus, and the transport
//! tempo. Every time argument is in seconds on the scheduler's timeline.
//!
//! [`AudioGraph`](crate::graph::AudioGraph) is the in-memory implementation
//! used by tests and headless hosts.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

slotmap::new_key_type! {
    /// Handle to a node owned by the backend
    pub struct NodeId;
}

/// Basic oscillator shapes selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OscillatorShape {
    #[default]
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

/// Oscillator waveform
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Square,
    /// One cycle of an arbitrary periodic waveform
    Custom(Arc<[f32]>),
}

impl From<OscillatorShape> for Waveform {
    fn from(shape: OscillatorShape) -> Self {
        match shape {
            OscillatorShape::Sine => Waveform::Sine,
            OscillatorShape::Triangle => Waveform::Triangle,
            OscillatorShape::Sawtooth => Waveform::Sawtooth,
            OscillatorShape::Square => Waveform::Square,
        }
    }
}

/// Biquad filter response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
}

/// ADSR envelope times in seconds, sustain as a level (0.0–1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Adsr {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.2,
            sustain: 0.6,
            release: 0.3,
        }
    }
}

impl Adsr {
    pub fn new(attack: f64, decay: f64, sustain: f64, release: f64) -> Self {
        Self {
            attack,
            decay,
            sustain,
            release,
        }
    }

    /// Clamp every stage into a usable range
    pub fn sanitized(self) -> Self {
        Self {
            attack: finite_or(self.attack, 0.01).clamp(0.001, 10.0),
            decay: finite_or(self.decay, 0.2).clamp(0.0, 10.0),
            sustain: finite_or(self.sustain, 0.6).clamp(0.0, 1.0),
            release: finite_or(self.release, 0.3).clamp(0.001, 10.0),
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Primitive the backend can allocate
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Oscillator { waveform: Waveform, frequency: f64 },
    Filter { mode: FilterMode, cutoff: f64, q: f64 },
    /// Amplitude envelope: passes its input scaled by the envelope level
    Envelope(Adsr),
    Gain { gain: f64 },
}

impl NodeKind {
    pub fn oscillator(waveform: impl Into<Waveform>, frequency: f64) -> Self {
        NodeKind::Oscillator {
            waveform: waveform.into(),
            frequency,
        }
    }

    pub fn gain(gain: f64) -> Self {
        NodeKind::Gain { gain }
    }

    /// Short identifier, used in logs and graph introspection
    pub fn type_id(&self) -> &'static str {
        match self {
            NodeKind::Oscillator { .. } => "oscillator",
            NodeKind::Filter { .. } => "filter",
            NodeKind::Envelope(_) => "envelope",
            NodeKind::Gain { .. } => "gain",
        }
    }

    /// Parameters this kind of node exposes for automation and modulation
    pub fn params(&self) -> &'static [Param] {
        match self {
            NodeKind::Oscillator { .. } => &[Param::Frequency, Param::Detune],
            NodeKind::Filter { .. } => &[Param::Cutoff, Param::Q],
            NodeKind::Envelope(_) => &[],
            NodeKind::Gain { .. } => &[Param::Gain],
        }
    }

    /// Whether the node accepts an audio signal input
    pub fn has_signal_input(&self) -> bool {
        !matches!(self, NodeKind::Oscillator { .. })
    }

    /// Initial value of an automatable parameter
    pub fn initial_value(&self, param: Param) -> Option<f64> {
        match (self, param) {
            (NodeKind::Oscillator { frequency, .. }, Param::Frequency) => Some(*frequency),
            (NodeKind::Oscillator { .. }, Param::Detune) => Some(0.0),
            (NodeKind::Filter { cutoff, .. }, Param::Cutoff) => Some(*cutoff),
            (NodeKind::Filter { q, .. }, Param::Q) => Some(*q),
            (NodeKind::Gain { gain }, Param::Gain) => Some(*gain),
            _ => None,
        }
    }
}

/// Automatable node parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    Frequency,
    Detune,
    Gain,
    Cutoff,
    Q,
}

/// Where a connection lands on its destination node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    /// The node's audio input
    Signal,
    /// Audio-rate modulation summed into a parameter
    Param(Param),
}

/// Reference to a specific input on a specific node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub node: NodeId,
    pub input: Input,
}

impl Port {
    pub fn signal(node: NodeId) -> Self {
        Self {
            node,
            input: Input::Signal,
        }
    }

    pub fn param(node: NodeId, param: Param) -> Self {
        Self {
            node,
            input: Input::Param(param),
        }
    }
}

/// Factory and patch bay for audio primitives
///
/// Implementations own the nodes; the core only ever holds [`NodeId`]s.
/// Operations on a disposed node must fail with
/// [`BackendError::InvalidNode`] rather than panic.
pub trait AudioBackend {
    /// Whether the audio context is running and can accept graph changes
    fn is_ready(&self) -> bool;

    /// Whether the shared transport clock can be started
    fn transport_ready(&self) -> bool {
        self.is_ready()
    }

    /// Set the transport tempo in beats per minute
    fn set_tempo(&mut self, bpm: f64);

    /// The shared output bus every voice connects to
    fn master(&self) -> NodeId;

    /// Allocate a new node
    fn create(&mut self, kind: NodeKind) -> Result<NodeId, BackendError>;

    /// Route a node's output into another node's input or parameter
    fn connect(&mut self, from: NodeId, to: Port) -> Result<(), BackendError>;

    /// Remove every connection leaving `node`
    fn disconnect(&mut self, node: NodeId) -> Result<(), BackendError>;

    /// Jump a parameter to `value` at time `at`
    fn set_param(
        &mut self,
        node: NodeId,
        param: Param,
        value: f64,
        at: f64,
    ) -> Result<(), BackendError>;

    /// Ramp a parameter linearly to `value`, starting at `at` and lasting `duration`
    fn ramp_param(
        &mut self,
        node: NodeId,
        param: Param,
        value: f64,
        at: f64,
        duration: f64,
    ) -> Result<(), BackendError>;

    /// Start an oscillator
    fn start(&mut self, node: NodeId, at: f64) -> Result<(), BackendError>;

    /// Stop an oscillator
    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), BackendError>;

    /// Begin the attack stage of an envelope
    fn trigger_attack(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError>;

    /// Begin the release stage of an envelope
    fn trigger_release(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError>;

    /// Free a node; its connections are removed with it
    fn dispose(&mut self, node: NodeId) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adsr_sanitized() {
        let env = Adsr::new(-1.0, f64::NAN, 4.0, 0.0).sanitized();
        assert_eq!(env.attack, 0.001);
        assert_eq!(env.decay, 0.2);
        assert_eq!(env.sustain, 1.0);
        assert_eq!(env.release, 0.001);
    }

    #[test]
    fn test_node_kind_params() {
        let osc = NodeKind::oscillator(OscillatorShape::Sawtooth, 220.0);
        assert!(!osc.has_signal_input());
        assert_eq!(osc.initial_value(Param::Frequency), Some(220.0));
        assert_eq!(osc.initial_value(Param::Gain), None);

        let gain = NodeKind::gain(0.5);
        assert!(gain.has_signal_input());
        assert_eq!(gain.params(), &[Param::Gain]);
    }
}
