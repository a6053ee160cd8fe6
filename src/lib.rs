//! # Driftwave: Generative Synthesis and Sequencing Core
//!
//! `driftwave` is the headless core of a generative synthesizer. It builds
//! short-lived voices out of oscillator, filter, envelope and gain
//! primitives, runs a 16-step acid-style sequencer, and drives three
//! generative engines: granular clouds, Gendy stochastic waveforms and
//! chaos-modulated oscillators.
//!
//! ## Architecture
//!
//! The crate is organized in three layers:
//!
//! - **Layer 1: Backend** - The [`AudioBackend`] trait for the primitives
//!   the core allocates and automates, with [`AudioGraph`] as an in-memory
//!   implementation
//! - **Layer 2: Voices and Engines** - Voice lifecycle with rollback on
//!   failed construction, plus the subtractive, granular, Gendy and chaos
//!   subgraphs
//! - **Layer 3: Control** - The step sequencer, pattern library and the
//!   [`Synth`] facade
//!
//! Everything that happens later (grains, regenerations, chaos steps,
//! sequencer ticks, note-offs, disposal) is a task on a [`Scheduler`]; the
//! host moves time forward with [`Synth::advance`].
//!
//! ## Quick Start
//!
//! ```rust
//! use driftwave::prelude::*;
//!
//! let mut synth = Synth::with_backend(AudioGraph::new(44100.0));
//!
//! // A granular cloud around A3 for half a second
//! synth.switch_engine("granular").unwrap();
//! synth.play_note("A3", Some(0.5), Some(0.7)).unwrap();
//!
//! // An acid line underneath
//! synth.load_pattern("acid").unwrap();
//! synth.set_tempo(132.0);
//! synth.start_sequencer().unwrap();
//!
//! synth.advance(1.0);
//! let status = synth.get_status();
//! assert!(status.sequencer_running);
//! ```

pub mod backend;
pub mod chaos;
pub mod config;
pub mod error;
pub mod gendy;
pub mod graph;
pub mod granular;
pub mod note;
pub mod patterns;
pub mod scheduler;
pub mod sequencer;
pub mod subtractive;
pub mod synth;
pub mod voice;

/// Prelude module for convenient imports
pub mod prelude {
    // Layer 1: Backend
    pub use crate::backend::{
        Adsr, AudioBackend, FilterMode, NodeId, NodeKind, OscillatorShape, Param, Port, Waveform,
    };
    pub use crate::graph::AudioGraph;

    // Layer 2: Voices and Engines
    pub use crate::chaos::{ChaosState, ChaosSystem, ModulationMode};
    pub use crate::gendy::{GendyGenerator, Interpolation};
    pub use crate::granular::GrainShape;
    pub use crate::voice::{EngineKind, VoiceId, VoiceKind, VoiceManager, VoiceModifiers};

    // Layer 3: Control
    pub use crate::patterns::{Pattern, PatternLibrary};
    pub use crate::sequencer::{Sequence, SequenceState, StepSequencer, STEPS};
    pub use crate::synth::{Status, Synth};

    // Shared
    pub use crate::config::SynthConfig;
    pub use crate::error::{BackendError, SynthError};
    pub use crate::note::{Note, Pitch};
    pub use crate::scheduler::{Scheduler, Task, VirtualClock};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
