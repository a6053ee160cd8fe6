//! Step Sequencer
//!
//! A 16-step monophonic sequencer in the style of an acid bass line
//! sequencer. Each step holds an optional note and may be flagged as an
//! accent (louder, snappier) or a slide (legato glide into the step).
//!
//! The sequencer runs on the shared [`Scheduler`]: every tick resolves the
//! step at `current_step`, then advances it, then schedules the next tick
//! one sixteenth note later. Each start/stop cycle gets a new run number so
//! a tick queued by an earlier run does nothing.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use crate::config::clamp_tempo;
use crate::error::SynthError;
use crate::note::{validate_frequency, Note};
use crate::scheduler::{Task, TaskId};
use crate::voice::{Context, VoiceId, VoiceKind, VoiceManager, VoiceModifiers, VoiceOwner, VoiceRequest};
use serde::Serialize;
use std::collections::BTreeSet;

/// Steps per pattern
pub const STEPS: usize = 16;

/// Seconds per sixteenth note
pub fn step_duration(bpm: f64) -> f64 {
    60.0 / clamp_tempo(bpm) / 4.0
}

/// Notes plus accent and slide flags
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sequence {
    notes: [Option<Note>; STEPS],
    accents: BTreeSet<usize>,
    slides: BTreeSet<usize>,
}

fn check(index: usize) -> Result<usize, SynthError> {
    if index < STEPS {
        Ok(index)
    } else {
        Err(SynthError::InvalidStep(index))
    }
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&self, index: usize) -> Option<Note> {
        self.notes.get(index).copied().flatten()
    }

    /// Set or clear a step; clearing also drops its accent and slide
    pub fn set(&mut self, index: usize, note: Option<Note>) -> Result<(), SynthError> {
        let index = check(index)?;
        self.notes[index] = note;
        if note.is_none() {
            self.accents.remove(&index);
            self.slides.remove(&index);
        }
        Ok(())
    }

    pub fn clear_step(&mut self, index: usize) -> Result<(), SynthError> {
        self.set(index, None)
    }

    /// Flip a step's accent; returns the new state
    pub fn toggle_accent(&mut self, index: usize) -> Result<bool, SynthError> {
        let index = check(index)?;
        Ok(toggle(&mut self.accents, index))
    }

    /// Flip a step's slide; returns the new state
    pub fn toggle_slide(&mut self, index: usize) -> Result<bool, SynthError> {
        let index = check(index)?;
        Ok(toggle(&mut self.slides, index))
    }

    pub fn is_accent(&self, index: usize) -> bool {
        self.accents.contains(&index)
    }

    pub fn is_slide(&self, index: usize) -> bool {
        self.slides.contains(&index)
    }

    pub fn accents(&self) -> impl Iterator<Item = usize> + '_ {
        self.accents.iter().copied()
    }

    pub fn slides(&self) -> impl Iterator<Item = usize> + '_ {
        self.slides.iter().copied()
    }

    pub fn note_count(&self) -> usize {
        self.notes.iter().filter(|n| n.is_some()).count()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn toggle(set: &mut BTreeSet<usize>, index: usize) -> bool {
    if set.remove(&index) {
        false
    } else {
        set.insert(index);
        true
    }
}

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    #[default]
    Stopped,
    Running,
}

/// Serializable snapshot of the sequencer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceState {
    pub steps: Vec<Option<String>>,
    pub accents: Vec<usize>,
    pub slides: Vec<usize>,
    pub current_step: usize,
    pub playing_step: Option<usize>,
    pub length: usize,
    pub tempo: f64,
    pub running: bool,
}

/// Sequencer transport and step resolution
#[derive(Debug, Default)]
pub struct StepSequencer {
    sequence: Sequence,
    state: TransportState,
    current_step: usize,
    playing_step: Option<usize>,
    run: u64,
    pending: Option<TaskId>,
    voice: Option<VoiceId>,
    /// The current voice has no note-off and waits for the next step
    held: bool,
    ticks: u64,
}

impl StepSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn sequence_mut(&mut self) -> &mut Sequence {
        &mut self.sequence
    }

    pub fn set_sequence(&mut self, sequence: Sequence) {
        self.sequence = sequence;
    }

    pub fn is_running(&self) -> bool {
        self.state == TransportState::Running
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Step the next tick will resolve
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Step resolved by the last tick
    pub fn playing_step(&self) -> Option<usize> {
        self.playing_step
    }

    /// Ticks since the sequencer was created
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The voice the sequencer is currently sounding
    pub fn voice(&self) -> Option<VoiceId> {
        self.voice
    }

    /// Start from step 0. Starting a running sequencer does nothing.
    pub fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), SynthError> {
        if self.is_running() {
            return Ok(());
        }
        if !ctx.backend.is_ready() || !ctx.backend.transport_ready() {
            log::warn!(target: "driftwave", "sequencer start refused: transport not ready");
            return Err(SynthError::BackendNotReady);
        }
        ctx.backend.set_tempo(ctx.config.sequencer.tempo);

        self.run += 1;
        self.state = TransportState::Running;
        self.current_step = 0;
        self.playing_step = None;
        self.pending = Some(
            ctx.scheduler
                .schedule_after(0.0, Task::SequencerTick { run: self.run }),
        );
        log::info!(
            target: "driftwave",
            "sequencer started at {} bpm",
            ctx.config.sequencer.tempo
        );
        Ok(())
    }

    /// Stop the transport and release the sequencer's voice
    pub fn stop(&mut self, voices: &mut VoiceManager, ctx: &mut Context<'_>) {
        if !self.is_running() {
            return;
        }
        self.state = TransportState::Stopped;
        self.run += 1;
        if let Some(pending) = self.pending.take() {
            ctx.scheduler.cancel(pending);
        }
        if let Some(voice) = self.voice.take() {
            voices.stop_voice(ctx, voice);
        }
        self.held = false;
        self.playing_step = None;
        log::info!(target: "driftwave", "sequencer stopped");
    }

    /// Handle a scheduled tick
    pub fn on_tick(
        &mut self,
        run: u64,
        voices: &mut VoiceManager,
        ctx: &mut Context<'_>,
        kind: VoiceKind,
    ) {
        if !self.is_running() || run != self.run {
            return;
        }
        let step = self.current_step;
        self.resolve(step, voices, ctx, kind);
        self.playing_step = Some(step);
        self.current_step = (step + 1) % STEPS;
        self.ticks += 1;

        let duration = step_duration(ctx.config.sequencer.tempo);
        self.pending = Some(
            ctx.scheduler
                .schedule_after(duration, Task::SequencerTick { run }),
        );
    }

    fn held_voice(&self, voices: &VoiceManager) -> Option<VoiceId> {
        self.voice
            .filter(|&id| self.held && voices.is_active(id))
    }

    fn resolve(
        &mut self,
        step: usize,
        voices: &mut VoiceManager,
        ctx: &mut Context<'_>,
        kind: VoiceKind,
    ) {
        let held = self.held_voice(voices);
        let note = self.sequence.note(step);
        let frequency = note.and_then(|n| validate_frequency(n.frequency()).ok());

        let Some(frequency) = frequency else {
            if let Some(note) = note {
                log::debug!(target: "driftwave", "step {} note {} is out of range", step, note);
            }
            if let Some(id) = held {
                voices.stop_voice(ctx, id);
            }
            self.held = false;
            return;
        };

        let modifiers = VoiceModifiers {
            accent: self.sequence.is_accent(step),
            slide: self.sequence.is_slide(step),
        };
        let config = &ctx.config.sequencer;
        let (velocity, gate, slide_time) = (config.velocity, config.gate, config.slide_time);
        let duration = step_duration(config.tempo);

        let id = match held {
            Some(id) if modifiers.slide => {
                voices.glide(ctx, id, frequency, slide_time, modifiers);
                id
            }
            _ => {
                if !modifiers.slide {
                    if let Some(previous) = self.voice {
                        voices.stop_voice(ctx, previous);
                    }
                }
                let request = VoiceRequest::new(kind, frequency, velocity)
                    .with_modifiers(modifiers)
                    .with_owner(VoiceOwner::Sequencer);
                match voices.start_voice(ctx, request) {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!(target: "driftwave", "step {} failed to sound: {}", step, e);
                        self.voice = None;
                        self.held = false;
                        return;
                    }
                }
            }
        };
        self.voice = Some(id);

        let next = (step + 1) % STEPS;
        let slides_on = self.sequence.is_slide(next) && self.sequence.note(next).is_some();
        self.held = modifiers.slide || slides_on;
        if !self.held {
            voices.schedule_note_off(ctx, id, duration * gate);
        }
    }

    pub fn snapshot(&self, tempo: f64) -> SequenceState {
        SequenceState {
            steps: (0..STEPS)
                .map(|i| self.sequence.note(i).map(|n| n.to_string()))
                .collect(),
            accents: self.sequence.accents().collect(),
            slides: self.sequence.slides().collect(),
            current_step: self.current_step,
            playing_step: self.playing_step,
            length: STEPS,
            tempo,
            running: self.is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn note(name: &str) -> Option<Note> {
        Some(name.parse().unwrap())
    }

    #[test]
    fn test_step_duration() {
        assert_relative_eq!(step_duration(120.0), 0.125);
        assert_relative_eq!(step_duration(60.0), 0.25);
        // Clamped to 200 bpm
        assert_relative_eq!(step_duration(400.0), 0.075);
    }

    #[test]
    fn test_indices_are_checked() {
        let mut sequence = Sequence::new();
        assert_eq!(sequence.set(16, note("C3")), Err(SynthError::InvalidStep(16)));
        assert_eq!(sequence.toggle_accent(99), Err(SynthError::InvalidStep(99)));
        assert_eq!(sequence.toggle_slide(16), Err(SynthError::InvalidStep(16)));
        assert_eq!(sequence.clear_step(16), Err(SynthError::InvalidStep(16)));
        assert!(sequence.set(15, note("C3")).is_ok());
    }

    #[test]
    fn test_clear_step_drops_flags() {
        let mut sequence = Sequence::new();
        sequence.set(3, note("E3")).unwrap();
        assert!(sequence.toggle_accent(3).unwrap());
        assert!(sequence.toggle_slide(3).unwrap());

        sequence.clear_step(3).unwrap();
        assert_eq!(sequence.note(3), None);
        assert!(!sequence.is_accent(3));
        assert!(!sequence.is_slide(3));
    }

    #[test]
    fn test_toggle_twice_restores() {
        let mut sequence = Sequence::new();
        assert!(sequence.toggle_accent(5).unwrap());
        assert!(!sequence.toggle_accent(5).unwrap());
        assert_eq!(sequence.accents().count(), 0);
    }

    #[test]
    fn test_snapshot() {
        let mut sequencer = StepSequencer::new();
        sequencer.sequence_mut().set(0, note("C3")).unwrap();
        sequencer.sequence_mut().toggle_accent(0).unwrap();

        let state = sequencer.snapshot(120.0);
        assert_eq!(state.steps.len(), STEPS);
        assert_eq!(state.steps[0].as_deref(), Some("C3"));
        assert_eq!(state.accents, vec![0]);
        assert!(!state.running);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["currentStep"], 0);
        assert_eq!(json["length"], 16);
        assert!(json.get("playingStep").is_some());
    }
}
