//! Synth Facade
//!
//! [`Synth`] is the whole engine behind one narrow surface: play and stop
//! notes, pick a generative engine, edit and run the step sequencer, update
//! configuration, and drive time.
//!
//! ```
//! use driftwave::prelude::*;
//!
//! let mut synth = Synth::with_backend(AudioGraph::new(44100.0)).with_seed(1);
//! synth.switch_engine("chaos").unwrap();
//! let voice = synth.play_note("A2", Some(0.5), None).unwrap();
//!
//! synth.load_pattern("classic1").unwrap();
//! synth.start_sequencer().unwrap();
//! synth.advance(2.0);
//!
//! assert!(!synth.voices().contains(voice));
//! assert!(synth.get_status().sequencer_running);
//! ```

use crate::backend::AudioBackend;
use crate::config::{clamp_tempo, SequencerVoice, SynthConfig, VoiceMode};
use crate::error::SynthError;
use crate::note::{Note, Pitch};
use crate::patterns::{random_sequence, PatternLibrary};
use crate::scheduler::{Scheduler, Task, VirtualClock};
use crate::sequencer::{SequenceState, StepSequencer};
use crate::voice::{
    Context, EngineKind, VoiceId, VoiceKind, VoiceManager, VoiceOwner, VoiceRequest,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::Value;

/// Velocity of `play_note` when none is given
pub const DEFAULT_VELOCITY: f64 = 0.8;

/// Snapshot for hosts and UIs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub is_playing: bool,
    pub sequencer_running: bool,
    pub current_engine: EngineKind,
    pub active_voices: usize,
    pub active_grains: usize,
    pub current_step: usize,
    pub tempo: f64,
}

/// The synthesis and sequencing engine
pub struct Synth<B: AudioBackend, S: Scheduler = VirtualClock> {
    backend: B,
    scheduler: S,
    rng: SmallRng,
    config: SynthConfig,
    voices: VoiceManager,
    sequencer: StepSequencer,
    engine: EngineKind,
    last_direct: Option<VoiceId>,
}

impl<B: AudioBackend> Synth<B, VirtualClock> {
    /// Engine on a fresh virtual clock
    pub fn with_backend(backend: B) -> Self {
        Self::new(backend, VirtualClock::new())
    }
}

impl<B: AudioBackend, S: Scheduler> Synth<B, S> {
    pub fn new(backend: B, scheduler: S) -> Self {
        Self {
            backend,
            scheduler,
            rng: SmallRng::from_entropy(),
            config: SynthConfig::default(),
            voices: VoiceManager::new(),
            sequencer: StepSequencer::new(),
            engine: EngineKind::default(),
            last_direct: None,
        }
    }

    /// Reseed every random choice (grain jitter, regeneration timing, random patterns)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn with_config(mut self, config: SynthConfig) -> Self {
        self.config = config.sanitized();
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn voices(&self) -> &VoiceManager {
        &self.voices
    }

    pub fn sequencer(&self) -> &StepSequencer {
        &self.sequencer
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    fn split(&mut self) -> (Context<'_>, &mut VoiceManager, &mut StepSequencer) {
        (
            Context {
                backend: &mut self.backend,
                scheduler: &mut self.scheduler,
                rng: &mut self.rng,
                config: &self.config,
            },
            &mut self.voices,
            &mut self.sequencer,
        )
    }

    // =========================================================================
    // Time
    // =========================================================================

    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }

    /// Run everything due in the next `seconds`
    pub fn advance(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds <= 0.0 {
            return;
        }
        let target = self.now() + seconds;
        self.run_until(target);
    }

    /// Run everything due up to an absolute time
    pub fn run_until(&mut self, time: f64) {
        while let Some(due) = self.scheduler.next_due(time) {
            self.dispatch(due.task);
        }
        self.scheduler.advance_to(time);
    }

    fn dispatch(&mut self, task: Task) {
        let kind = self.sequencer_voice();
        let (mut ctx, voices, sequencer) = self.split();
        match task {
            Task::SequencerTick { run } => sequencer.on_tick(run, voices, &mut ctx, kind),
            task => voices.run_task(&mut ctx, task),
        }
    }

    fn sequencer_voice(&self) -> VoiceKind {
        match self.config.sequencer.voice {
            SequencerVoice::Subtractive => VoiceKind::Subtractive,
            SequencerVoice::Engine => self.engine.into(),
        }
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Play a note on the current engine
    ///
    /// With a `duration` the note releases itself; otherwise it sounds until
    /// [`Synth::stop_note`].
    pub fn play_note(
        &mut self,
        pitch: impl Into<Pitch>,
        duration: Option<f64>,
        velocity: Option<f64>,
    ) -> Result<VoiceId, SynthError> {
        if !self.backend.is_ready() {
            log::warn!(target: "driftwave", "play_note before the audio backend is ready");
            return Err(SynthError::BackendNotReady);
        }
        let frequency = pitch.into().resolve().map_err(|e| {
            log::warn!(target: "driftwave", "play_note rejected: {}", e);
            e
        })?;
        let velocity = velocity.unwrap_or(DEFAULT_VELOCITY);
        let request = VoiceRequest::new(self.engine.into(), frequency, velocity);
        let previous = match self.config.voice_mode {
            VoiceMode::Mono => self.last_direct,
            VoiceMode::Poly => None,
        };

        let (mut ctx, voices, _) = self.split();
        if let Some(previous) = previous {
            voices.stop_voice(&mut ctx, previous);
        }
        let id = voices.start_voice(&mut ctx, request)?;
        if let Some(duration) = duration.filter(|d| d.is_finite() && *d >= 0.0) {
            voices.schedule_note_off(&mut ctx, id, duration);
        }
        self.last_direct = Some(id);
        Ok(id)
    }

    /// Release one voice, or every voice with `None`; returns how many were released
    pub fn stop_note(&mut self, voice: Option<VoiceId>) -> usize {
        let (mut ctx, voices, _) = self.split();
        match voice {
            Some(id) => usize::from(voices.stop_voice(&mut ctx, id)),
            None => voices.stop_all(&mut ctx),
        }
    }

    pub fn stop_all(&mut self) -> usize {
        self.stop_note(None)
    }

    /// Make `name` the engine for new notes, releasing notes of the old one
    pub fn switch_engine(&mut self, name: &str) -> Result<EngineKind, SynthError> {
        let kind: EngineKind = name.parse().map_err(|e| {
            log::warn!(target: "driftwave", "{}", e);
            e
        })?;
        if kind != self.engine {
            let (mut ctx, voices, _) = self.split();
            let released = voices.stop_where(&mut ctx, |v| v.owner == VoiceOwner::Direct);
            log::info!(
                target: "driftwave",
                "switched engine {} -> {} ({} voices released)",
                self.engine,
                kind,
                released
            );
            self.engine = kind;
        }
        Ok(kind)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Deep-merge a partial JSON configuration
    ///
    /// Unknown keys are ignored, out-of-range values clamped. A value of the
    /// wrong type rejects the whole update.
    pub fn update_config(&mut self, patch: &Value) -> Result<(), SynthError> {
        let next = self.config.merged(patch).map_err(|e| {
            log::warn!(target: "driftwave", "{}", e);
            e
        })?;
        if next.sequencer.tempo != self.config.sequencer.tempo {
            self.backend.set_tempo(next.sequencer.tempo);
        }
        self.config = next;
        Ok(())
    }

    pub fn get_config(&self) -> &SynthConfig {
        &self.config
    }

    // =========================================================================
    // Sequencer
    // =========================================================================

    pub fn start_sequencer(&mut self) -> Result<(), SynthError> {
        let (mut ctx, _, sequencer) = self.split();
        sequencer.start(&mut ctx)
    }

    pub fn stop_sequencer(&mut self) {
        let (mut ctx, voices, sequencer) = self.split();
        sequencer.stop(voices, &mut ctx);
    }

    pub fn set_step(&mut self, index: usize, note: &str) -> Result<(), SynthError> {
        let note: Note = note.parse()?;
        self.sequencer.sequence_mut().set(index, Some(note))
    }

    pub fn clear_step(&mut self, index: usize) -> Result<(), SynthError> {
        self.sequencer.sequence_mut().clear_step(index)
    }

    pub fn toggle_accent(&mut self, index: usize) -> Result<bool, SynthError> {
        self.sequencer.sequence_mut().toggle_accent(index)
    }

    pub fn toggle_slide(&mut self, index: usize) -> Result<bool, SynthError> {
        self.sequencer.sequence_mut().toggle_slide(index)
    }

    pub fn clear_sequence(&mut self) {
        self.sequencer.sequence_mut().clear();
    }

    pub fn load_pattern(&mut self, name: &str) -> Result<(), SynthError> {
        let pattern = PatternLibrary::get(name)
            .ok_or_else(|| SynthError::UnknownPattern(name.to_string()))?;
        self.sequencer.set_sequence(pattern.to_sequence());
        log::debug!(target: "driftwave", "loaded pattern {}", pattern.name);
        Ok(())
    }

    pub fn generate_random_pattern(&mut self) {
        let sequence = random_sequence(&mut self.rng);
        self.sequencer.set_sequence(sequence);
    }

    /// Set the tempo, clamped to 60–200 bpm; returns the tempo applied
    pub fn set_tempo(&mut self, bpm: f64) -> f64 {
        let tempo = clamp_tempo(bpm);
        self.config.sequencer.tempo = tempo;
        self.backend.set_tempo(tempo);
        tempo
    }

    pub fn get_sequence_state(&self) -> SequenceState {
        self.sequencer.snapshot(self.config.sequencer.tempo)
    }

    pub fn get_status(&self) -> Status {
        let active_voices = self.voices.active_count();
        Status {
            is_playing: active_voices > 0 || self.sequencer.is_running(),
            sequencer_running: self.sequencer.is_running(),
            current_engine: self.engine,
            active_voices,
            active_grains: self.voices.grains_in_flight(),
            current_step: self.sequencer.current_step(),
            tempo: self.config.sequencer.tempo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NodeKind, Param};
    use crate::error::BackendError;
    use crate::gendy::GendyGenerator;
    use crate::graph::AudioGraph;
    use crate::voice::{EngineState, VoiceState};
    use approx::assert_relative_eq;
    use serde_json::json;

    const STEP: f64 = 0.125;

    fn synth() -> Synth<AudioGraph> {
        Synth::with_backend(AudioGraph::new(44100.0)).with_seed(42)
    }

    fn oscillators(graph: &AudioGraph) -> Vec<crate::backend::NodeId> {
        graph
            .processing_order()
            .into_iter()
            .filter(|&n| matches!(graph.kind(n), Some(NodeKind::Oscillator { .. })))
            .collect()
    }

    fn sequencer_voice(synth: &Synth<AudioGraph>) -> &crate::voice::Voice {
        synth
            .sequencer()
            .voice()
            .and_then(|id| synth.voices().get(id))
            .expect("sequencer voice")
    }

    #[test]
    fn test_play_and_stop() {
        let mut synth = synth();
        let id = synth.play_note("A3", None, None).unwrap();
        assert_eq!(synth.get_status().active_voices, 1);
        assert!(synth.get_status().is_playing);

        assert_eq!(synth.stop_note(Some(id)), 1);
        assert_eq!(synth.stop_note(Some(id)), 0);
        synth.advance(2.0);

        assert!(!synth.voices().contains(id));
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
        assert!(!synth.get_status().is_playing);
    }

    #[test]
    fn test_duration_releases_note() {
        let mut synth = synth();
        synth.switch_engine("gendy").unwrap();
        let id = synth.play_note(220.0, Some(0.5), Some(0.6)).unwrap();

        synth.advance(0.49);
        assert!(synth.voices().is_active(id));
        synth.advance(0.02);
        assert_eq!(synth.voices().get(id).map(|v| v.state), Some(VoiceState::Releasing));
        synth.advance(2.0);
        assert!(!synth.voices().contains(id));
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
    }

    #[test]
    fn test_play_note_validation() {
        let mut synth = synth();
        assert!(matches!(
            synth.play_note(0.0, None, None),
            Err(SynthError::InvalidFrequency(_))
        ));
        assert!(matches!(
            synth.play_note("Q4", None, None),
            Err(SynthError::InvalidNote(_))
        ));
        assert!(matches!(
            synth.play_note("C2147483647", None, None),
            Err(SynthError::InvalidNote(_))
        ));
        assert!(matches!(
            synth.play_note("C4", None, Some(-0.1)),
            Err(SynthError::InvalidVelocity(_))
        ));
        assert_eq!(synth.backend().created_count(), 0);
    }

    #[test]
    fn test_not_ready() {
        let mut synth = Synth::with_backend(AudioGraph::suspended(44100.0));
        assert_eq!(
            synth.play_note("C3", None, None),
            Err(SynthError::BackendNotReady)
        );
        assert_eq!(synth.start_sequencer(), Err(SynthError::BackendNotReady));
        assert!(!synth.get_status().sequencer_running);
        assert_eq!(synth.backend().node_count(), 1);

        synth.backend_mut().set_ready(true);
        assert!(synth.play_note("C3", None, None).is_ok());
    }

    #[test]
    fn test_transport_not_ready() {
        let mut synth = synth();
        synth.backend_mut().set_transport_ready(false);
        assert_eq!(synth.start_sequencer(), Err(SynthError::BackendNotReady));
        assert!(synth.play_note("C3", None, None).is_ok());
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        let mut synth = synth();
        synth.switch_engine("gendy").unwrap();
        synth.backend_mut().set_capacity(Some(2));

        assert_eq!(
            synth.play_note("C3", None, None),
            Err(SynthError::Backend(BackendError::Exhausted))
        );
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().cable_count(), 0);
        assert!(synth.voices().is_empty());
    }

    #[test]
    fn test_invalid_engine_switch() {
        let mut synth = synth();
        synth.switch_engine("chaos").unwrap();
        assert_eq!(
            synth.switch_engine("wavetable"),
            Err(SynthError::UnknownEngine("wavetable".into()))
        );
        assert_eq!(synth.engine(), EngineKind::Chaos);
    }

    #[test]
    fn test_switch_engine_releases_direct_voices() {
        let mut synth = synth();
        let granular = synth.play_note("C3", None, None).unwrap();
        synth.switch_engine("granular").unwrap();
        assert!(synth.voices().is_active(granular));

        synth.switch_engine("chaos").unwrap();
        assert!(!synth.voices().is_active(granular));
        let chaos = synth.play_note("C3", None, None).unwrap();
        assert_eq!(synth.voices().get(chaos).map(|v| v.kind), Some(VoiceKind::Chaos));
    }

    #[test]
    fn test_mono_voice_mode() {
        let mut synth = synth();
        synth.update_config(&json!({ "voice_mode": "mono" })).unwrap();
        let first = synth.play_note("C3", None, None).unwrap();
        let second = synth.play_note("E3", None, None).unwrap();
        assert!(!synth.voices().is_active(first));
        assert!(synth.voices().is_active(second));
    }

    #[test]
    fn test_stop_all_notes() {
        let mut synth = synth();
        for note in ["C3", "E3", "G3"] {
            synth.play_note(note, None, None).unwrap();
        }
        assert_eq!(synth.stop_note(None), 3);
        assert_eq!(synth.get_status().active_voices, 0);
    }

    #[test]
    fn test_update_config() {
        let mut synth = synth();
        synth
            .update_config(&json!({
                "granular": { "density": 40, "grain_size": 5000.0 },
                "chaos": { "system": "duffing" },
                "not_a_key": true
            }))
            .unwrap();
        let config = synth.get_config();
        assert_eq!(config.granular.density, 40.0);
        assert_eq!(config.granular.grain_size, 200.0);
        assert_eq!(config.granular.pitch_spread, 50.0);
        assert_eq!(config.chaos.system, crate::chaos::ChaosSystem::Duffing);

        let before = synth.get_config().clone();
        assert!(matches!(
            synth.update_config(&json!({ "gendy": { "points": "many" } })),
            Err(SynthError::InvalidConfig(_))
        ));
        assert!(synth.update_config(&json!(3)).is_err());
        assert_eq!(synth.get_config(), &before);
    }

    #[test]
    fn test_tempo_clamping() {
        let mut synth = synth();
        assert_eq!(synth.set_tempo(500.0), 200.0);
        assert_eq!(synth.set_tempo(10.0), 60.0);
        assert_eq!(synth.set_tempo(f64::NAN), 120.0);
        assert_eq!(synth.set_tempo(90.0), 90.0);
        assert_eq!(synth.backend().tempo(), 90.0);
        assert_eq!(synth.get_status().tempo, 90.0);

        synth.update_config(&json!({ "sequencer": { "tempo": 1000 } })).unwrap();
        assert_eq!(synth.get_config().sequencer.tempo, 200.0);
        assert_eq!(synth.backend().tempo(), 200.0);
    }

    #[test]
    fn test_sequence_editing() {
        let mut synth = synth();
        synth.set_step(3, "F#2").unwrap();
        assert!(synth.toggle_accent(3).unwrap());
        assert!(synth.toggle_slide(3).unwrap());
        assert_eq!(synth.set_step(16, "C3"), Err(SynthError::InvalidStep(16)));
        assert!(matches!(synth.set_step(0, "nope"), Err(SynthError::InvalidNote(_))));
        assert!(matches!(
            synth.set_step(0, "G2147483647"),
            Err(SynthError::InvalidNote(_))
        ));
        assert_eq!(synth.toggle_accent(20), Err(SynthError::InvalidStep(20)));
        assert_eq!(
            synth.load_pattern("missing"),
            Err(SynthError::UnknownPattern("missing".into()))
        );

        let state = synth.get_sequence_state();
        assert_eq!(state.steps[3].as_deref(), Some("F#2"));
        assert_eq!(state.accents, vec![3]);
        assert_eq!(state.slides, vec![3]);

        synth.clear_step(3).unwrap();
        let state = synth.get_sequence_state();
        assert_eq!(state.steps[3], None);
        assert!(state.accents.is_empty());
        assert!(state.slides.is_empty());

        synth.generate_random_pattern();
        synth.clear_sequence();
        assert!(synth.get_sequence_state().steps.iter().all(Option::is_none));
    }

    #[test]
    fn test_step_wraparound() {
        let mut synth = synth();
        synth.load_pattern("acid").unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.001);
        assert_eq!(synth.sequencer().current_step(), 1);

        synth.advance(36.0 * STEP);
        assert_eq!(synth.sequencer().ticks(), 37);
        assert_eq!(synth.sequencer().current_step(), 37 % 16);
        assert_eq!(synth.sequencer().playing_step(), Some(36 % 16));
    }

    #[test]
    fn test_classic1_scenario() {
        let mut synth = synth();
        synth.load_pattern("classic1").unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.001);

        // Step 0: C3 accented
        let voice = sequencer_voice(&synth);
        assert_relative_eq!(voice.frequency, 130.8128, epsilon = 1e-3);
        assert!(voice.modifiers.accent);
        assert_relative_eq!(voice.peak_gain, 0.7 * 0.8 * 1.5, epsilon = 1e-12);
        let first = synth.sequencer().voice().unwrap();

        // Note-off at 80% of the step
        synth.advance(0.09);
        assert!(synth.voices().is_active(first));
        synth.advance(0.02);
        assert!(!synth.voices().is_active(first));

        // Step 2: E3, plain
        synth.advance(2.0 * STEP - 0.11);
        let voice = sequencer_voice(&synth);
        assert_relative_eq!(voice.frequency, 164.8138, epsilon = 1e-3);
        assert!(!voice.modifiers.accent);
        assert_relative_eq!(voice.peak_gain, 0.7 * 0.8, epsilon = 1e-12);

        // Step 4: G3 slides in, so no note-off until step 5 clears it
        synth.advance(2.0 * STEP);
        let slide = synth.sequencer().voice().unwrap();
        assert!(sequencer_voice(&synth).modifiers.slide);
        synth.advance(0.11);
        assert!(synth.voices().is_active(slide));
        synth.advance(STEP);
        assert!(!synth.voices().is_active(slide));

        // Step 8: G3 accented again
        synth.advance(3.0 * STEP);
        assert_eq!(synth.sequencer().playing_step(), Some(8));
        assert!(sequencer_voice(&synth).modifiers.accent);

        synth.stop_sequencer();
        synth.advance(2.0);
        assert_eq!(synth.get_status().active_voices, 0);
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
    }

    #[test]
    fn test_slide_glides_held_voice() {
        let mut synth = synth();
        synth.set_step(0, "C3").unwrap();
        synth.set_step(1, "E3").unwrap();
        synth.toggle_slide(1).unwrap();
        synth.start_sequencer().unwrap();

        synth.advance(0.001);
        let held = synth.sequencer().voice().unwrap();
        // Held past the gate because the next step slides in
        synth.advance(0.11);
        assert!(synth.voices().is_active(held));

        synth.advance(STEP - 0.11);
        assert_eq!(synth.sequencer().voice(), Some(held));
        let voice = synth.voices().get(held).unwrap();
        assert_relative_eq!(voice.frequency, 164.8138, epsilon = 1e-3);
        let EngineState::Subtractive { oscillator, .. } = *voice.engine() else {
            panic!("expected a subtractive voice");
        };
        let glide = synth
            .backend()
            .automation()
            .iter()
            .rev()
            .find(|a| a.node == oscillator && a.param == Param::Frequency)
            .copied()
            .unwrap();
        assert_relative_eq!(glide.duration, 0.06);
        assert_relative_eq!(glide.at, STEP);

        // Step 2 is empty and releases the held voice
        synth.advance(STEP);
        assert!(!synth.voices().is_active(held));
    }

    #[test]
    fn test_non_slide_stops_previous_first() {
        let mut synth = synth();
        synth.set_step(0, "C3").unwrap();
        synth.set_step(1, "D3").unwrap();
        synth.update_config(&json!({ "sequencer": { "gate": 1.0 } })).unwrap();
        synth.start_sequencer().unwrap();

        synth.advance(0.001);
        let first = synth.sequencer().voice().unwrap();
        synth.advance(STEP - 0.01);
        assert!(synth.voices().is_active(first));

        synth.advance(0.02);
        let second = synth.sequencer().voice().unwrap();
        assert_ne!(first, second);
        assert!(!synth.voices().is_active(first));
        assert!(synth.voices().is_active(second));
    }

    #[test]
    fn test_out_of_range_step_is_skipped() {
        let mut synth = synth();
        // MIDI 0 is about 8 Hz
        synth.set_step(0, "C-1").unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.001);

        assert_eq!(synth.sequencer().playing_step(), Some(0));
        assert_eq!(synth.sequencer().voice(), None);
        assert!(synth.voices().is_empty());
        assert_eq!(synth.backend().node_count(), 1);
    }

    #[test]
    fn test_out_of_range_slide_releases_held_voice() {
        let mut synth = synth();
        synth.set_step(0, "C3").unwrap();
        synth.set_step(1, "C-1").unwrap();
        synth.toggle_slide(1).unwrap();
        synth.start_sequencer().unwrap();

        synth.advance(0.001);
        let held = synth.sequencer().voice().unwrap();
        synth.advance(0.11);
        assert!(synth.voices().is_active(held));

        synth.advance(STEP - 0.11);
        assert_eq!(synth.sequencer().playing_step(), Some(1));
        assert!(!synth.voices().is_active(held));
        assert_eq!(synth.get_status().active_voices, 0);
    }

    #[test]
    fn test_accent_stays_louder_at_lowest_boost() {
        let mut synth = synth();
        synth.update_config(&json!({ "accent_boost": 1.0 })).unwrap();
        synth.load_pattern("classic1").unwrap();
        synth.start_sequencer().unwrap();

        synth.advance(0.001);
        let accented = sequencer_voice(&synth).peak_gain;
        synth.advance(2.0 * STEP);
        let plain = sequencer_voice(&synth).peak_gain;
        assert!(!sequencer_voice(&synth).modifiers.accent);
        assert!(accented > plain, "accented {} plain {}", accented, plain);
    }

    #[test]
    fn test_stop_sequencer() {
        let mut synth = synth();
        synth.load_pattern("acid").unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.5);
        synth.stop_sequencer();
        synth.stop_sequencer();

        let step = synth.sequencer().current_step();
        synth.advance(1.0);
        assert_eq!(synth.sequencer().current_step(), step);
        assert_eq!(synth.get_status().active_voices, 0);
        assert!(!synth.get_sequence_state().running);
    }

    #[test]
    fn test_restart_ignores_stale_tick() {
        let mut synth = synth();
        synth.load_pattern("acid").unwrap();
        synth.start_sequencer().unwrap();
        synth.stop_sequencer();
        synth.start_sequencer().unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.001);
        assert_eq!(synth.sequencer().ticks(), 1);
    }

    #[test]
    fn test_sequencer_on_engine_voices() {
        let mut synth = synth();
        synth.switch_engine("chaos").unwrap();
        synth.update_config(&json!({ "sequencer": { "voice": "engine" } })).unwrap();
        synth.load_pattern("minimal").unwrap();
        synth.start_sequencer().unwrap();
        synth.advance(0.001);
        assert_eq!(sequencer_voice(&synth).kind, VoiceKind::Chaos);

        synth.stop_sequencer();
        synth.advance(3.0);
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
    }

    #[test]
    fn test_granular_density() {
        let mut synth = synth();
        synth.switch_engine("granular").unwrap();
        let id = synth.play_note("A3", None, None).unwrap();

        let mut peak_in_flight = 0;
        for _ in 0..1000 {
            synth.advance(0.01);
            peak_in_flight = peak_in_flight.max(synth.get_status().active_grains);
        }
        let Some(EngineState::Granular(grains)) = synth.voices().get(id).map(|v| v.engine())
        else {
            panic!("expected a granular voice");
        };
        // 20 grains/s for 10 s
        assert!((180..=220).contains(&grains.spawned), "{} grains", grains.spawned);
        assert!(peak_in_flight <= 3);
    }

    #[test]
    fn test_grains_never_outlive_cap() {
        let mut synth = synth();
        synth.switch_engine("granular").unwrap();
        synth
            .update_config(&json!({ "granular": { "grain_size": 5000, "density": 50 } }))
            .unwrap();
        let id = synth.play_note("A3", None, None).unwrap();

        for _ in 0..50 {
            synth.advance(0.02);
            let now = synth.now();
            for osc in oscillators(synth.backend()) {
                let stop = synth.backend().stop_time(osc).expect("grain stop time");
                assert!(stop <= now + 0.2 + 1e-9);
            }
        }

        synth.stop_note(Some(id));
        synth.advance(1.0);
        assert_eq!(synth.get_status().active_grains, 0);
        assert_eq!(synth.backend().count_of("oscillator"), 0);
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
    }

    #[test]
    fn test_gendy_is_deterministic() {
        let run = || {
            let mut synth = synth();
            synth.switch_engine("gendy").unwrap();
            let id = synth.play_note("C2", None, None).unwrap();
            synth.advance(2.0);
            match synth.voices().get(id).map(|v| v.engine()) {
                Some(EngineState::Gendy(g)) => (g.generations, g.waveform.clone()),
                _ => panic!("expected a gendy voice"),
            }
        };
        let (generations, waveform) = run();
        assert_eq!(run(), (generations, waveform.clone()));
        assert!(generations > 1);

        let config = crate::config::GendyConfig::default();
        let mut generator = GendyGenerator::new(config.seed);
        let mut expected = generator.generate(&config);
        for _ in 1..generations {
            expected = generator.generate(&config);
        }
        assert_eq!(expected, waveform);
    }

    #[test]
    fn test_gendy_crossfade_cleanup() {
        let mut synth = synth();
        synth.switch_engine("gendy").unwrap();
        let id = synth.play_note("C2", None, None).unwrap();
        for _ in 0..100 {
            synth.advance(0.03);
            assert!(synth.backend().count_of("oscillator") <= 2);
        }
        synth.stop_note(Some(id));
        synth.advance(2.0);
        assert_eq!(synth.backend().node_count(), 1);
        assert_eq!(synth.backend().faults(), 0);
    }

    #[test]
    fn test_chaos_modulator_follows_attractor() {
        let mut synth = synth();
        synth.switch_engine("chaos").unwrap();
        let id = synth.play_note("A2", None, None).unwrap();
        synth.advance(1.0);

        let Some(EngineState::Chaos(chaos)) = synth.voices().get(id).map(|v| v.engine()) else {
            panic!("expected a chaos voice");
        };
        assert!((19..=20).contains(&chaos.steps));
        let rates: Vec<f64> = synth
            .backend()
            .automation()
            .iter()
            .filter(|a| a.node == chaos.modulator && a.param == Param::Frequency)
            .map(|a| a.value)
            .collect();
        assert_eq!(rates.len() as u64, chaos.steps);
        assert!(rates.iter().all(|r| (0.5..=10.5).contains(r)));
    }

    #[test]
    fn test_long_chaos_voice_keeps_automation_bounded() {
        let mut synth = synth();
        synth.switch_engine("chaos").unwrap();
        let id = synth.play_note("A2", None, None).unwrap();
        synth.advance(300.0);
        assert!(synth.voices().is_active(id));
        assert_eq!(
            synth.backend().automation().len(),
            crate::graph::AUTOMATION_LOG_LIMIT
        );
    }

    #[test]
    fn test_status_json() {
        let mut synth = synth();
        synth.play_note("C3", None, None).unwrap();
        let json = serde_json::to_value(synth.get_status()).unwrap();
        assert_eq!(json["isPlaying"], true);
        assert_eq!(json["sequencerRunning"], false);
        assert_eq!(json["currentEngine"], "granular");
        assert_eq!(json["activeVoices"], 1);
        assert_eq!(json["currentStep"], 0);
        assert_eq!(json["tempo"], 120.0);
        assert!(json.get("activeGrains").is_some());
    }
}
