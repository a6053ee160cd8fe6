//! Subtractive Voice
//!
//! The sequencer's default voice: one oscillator through a resonant filter
//! and an envelope. Accents open the filter and shorten the decay.

use crate::backend::{NodeId, NodeKind, Port};
use crate::config::SubtractiveConfig;
use crate::error::BackendError;
use crate::voice::{articulate, Built, EngineState, GraphBuilder, VoiceModifiers};

/// Filter cutoff for a note, opened up on accents
pub fn cutoff(config: &SubtractiveConfig, modifiers: VoiceModifiers) -> f64 {
    let cutoff = if modifiers.accent {
        config.cutoff * config.accent_cutoff
    } else {
        config.cutoff
    };
    cutoff.min(20_000.0)
}

pub(crate) fn build(
    builder: &mut GraphBuilder<'_>,
    config: &SubtractiveConfig,
    frequency: f64,
    modifiers: VoiceModifiers,
    output: NodeId,
    now: f64,
) -> Result<Built, BackendError> {
    let envelope = articulate(config.envelope, modifiers);

    let oscillator = builder.add(NodeKind::oscillator(config.waveform, frequency))?;
    let filter = builder.add(NodeKind::Filter {
        mode: config.filter,
        cutoff: cutoff(config, modifiers),
        q: config.resonance,
    })?;
    let env = builder.add(NodeKind::Envelope(envelope))?;

    builder.connect(oscillator, Port::signal(filter))?;
    builder.connect(filter, Port::signal(env))?;
    builder.connect(env, Port::signal(output))?;

    builder.start(oscillator, now)?;
    builder.trigger_attack(env, now)?;

    Ok(Built {
        engine: EngineState::Subtractive { oscillator, filter },
        envelopes: vec![env],
        oscillators: vec![oscillator],
        release: envelope.release,
    })
}
