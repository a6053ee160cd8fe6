//! Voice Lifecycle
//!
//! A voice is one sounding note's subgraph: the nodes its engine allocated,
//! the envelopes that shape it, and a per-voice output gain connected to the
//! master bus. [`VoiceManager`] builds voices, releases them, and frees their
//! nodes once the release tail has run out.
//!
//! # Lifecycle
//!
//! - `start_voice` allocates everything through a [`GraphBuilder`]; if any
//!   allocation fails, everything allocated so far is disposed again.
//! - `stop_voice` triggers release and queues a [`Task::Dispose`] after the
//!   longest release. Calling it again is a no-op.
//! - Disposal removes the voice from the arena, which invalidates its
//!   [`VoiceId`]. Tasks still queued for it find nothing and do nothing.

use crate::backend::{Adsr, AudioBackend, NodeId, NodeKind, Param, Port};
use crate::chaos::{self, ChaosVoice};
use crate::config::{SynthConfig, MAX_GRAIN_SIZE_MS};
use crate::error::{BackendError, SynthError};
use crate::gendy::{self, GendyVoice};
use crate::granular::{self, GranularVoice};
use crate::note::validate_frequency;
use crate::scheduler::{Scheduler, Task, TaskId};
use crate::subtractive;
use core::fmt;
use core::str::FromStr;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Generational handle to a voice
    pub struct VoiceId;
}

/// Extra time after the release stage before nodes are freed
const DISPOSE_MARGIN: f64 = 0.05;

/// Generative synthesis engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Granular,
    Gendy,
    Chaos,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Granular, EngineKind::Gendy, EngineKind::Chaos];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Granular => "granular",
            EngineKind::Gendy => "gendy",
            EngineKind::Chaos => "chaos",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SynthError::UnknownEngine(s.to_string()))
    }
}

/// What produces a voice's sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceKind {
    Subtractive,
    Granular,
    Gendy,
    Chaos,
}

impl From<EngineKind> for VoiceKind {
    fn from(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Granular => VoiceKind::Granular,
            EngineKind::Gendy => VoiceKind::Gendy,
            EngineKind::Chaos => VoiceKind::Chaos,
        }
    }
}

/// Who asked for the voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOwner {
    Direct,
    Sequencer,
}

/// Per-note articulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceModifiers {
    pub accent: bool,
    pub slide: bool,
}

impl VoiceModifiers {
    pub fn accented() -> Self {
        Self {
            accent: true,
            slide: false,
        }
    }
}

/// State of a live voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Sounding; engine loops keep running
    Active,
    /// Envelopes released, disposal queued
    Releasing,
}

/// Engine-specific part of a voice
#[derive(Debug)]
pub enum EngineState {
    Subtractive { oscillator: NodeId, filter: NodeId },
    Granular(GranularVoice),
    Gendy(GendyVoice),
    Chaos(ChaosVoice),
}

/// Everything needed to start a voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceRequest {
    pub kind: VoiceKind,
    pub frequency: f64,
    pub velocity: f64,
    pub modifiers: VoiceModifiers,
    pub owner: VoiceOwner,
}

impl VoiceRequest {
    pub fn new(kind: VoiceKind, frequency: f64, velocity: f64) -> Self {
        Self {
            kind,
            frequency,
            velocity,
            modifiers: VoiceModifiers::default(),
            owner: VoiceOwner::Direct,
        }
    }

    pub fn with_modifiers(mut self, modifiers: VoiceModifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_owner(mut self, owner: VoiceOwner) -> Self {
        self.owner = owner;
        self
    }
}

/// A single sounding note
#[derive(Debug)]
pub struct Voice {
    pub kind: VoiceKind,
    pub owner: VoiceOwner,
    pub frequency: f64,
    pub velocity: f64,
    pub modifiers: VoiceModifiers,
    pub state: VoiceState,
    pub started_at: f64,
    /// Output gain at the top of the envelope
    pub peak_gain: f64,
    pub(crate) output: NodeId,
    pub(crate) envelopes: Vec<NodeId>,
    pub(crate) oscillators: Vec<NodeId>,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) release_tail: f64,
    pub(crate) engine: EngineState,
    pub(crate) note_off: Option<TaskId>,
}

impl Voice {
    pub fn is_active(&self) -> bool {
        self.state == VoiceState::Active
    }

    /// The voice's output gain node
    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn envelopes(&self) -> &[NodeId] {
        &self.envelopes
    }

    /// Every node the voice will free on disposal
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn engine(&self) -> &EngineState {
        &self.engine
    }

    /// Seconds between release and disposal
    pub fn release_tail(&self) -> f64 {
        self.release_tail
    }

    /// Stop tracking nodes that were freed on their own
    pub(crate) fn forget(&mut self, freed: &[NodeId]) {
        self.nodes.retain(|n| !freed.contains(n));
        self.oscillators.retain(|n| !freed.contains(n));
    }
}

/// Shared state handed to engines for one operation
pub struct Context<'a> {
    pub backend: &'a mut dyn AudioBackend,
    pub scheduler: &'a mut dyn Scheduler,
    pub rng: &'a mut SmallRng,
    pub config: &'a SynthConfig,
}

impl Context<'_> {
    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }
}

/// Allocation scope for one subgraph
///
/// Nodes created through the builder are disposed again when it is dropped
/// without [`GraphBuilder::commit`], so a failed construction never leaves a
/// partially connected graph behind.
pub struct GraphBuilder<'a> {
    backend: &'a mut dyn AudioBackend,
    nodes: Vec<NodeId>,
    committed: bool,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(backend: &'a mut dyn AudioBackend) -> Self {
        Self {
            backend,
            nodes: Vec::new(),
            committed: false,
        }
    }

    pub fn add(&mut self, kind: NodeKind) -> Result<NodeId, BackendError> {
        let id = self.backend.create(kind)?;
        self.nodes.push(id);
        Ok(id)
    }

    pub fn connect(&mut self, from: NodeId, to: Port) -> Result<(), BackendError> {
        self.backend.connect(from, to)
    }

    pub fn start(&mut self, oscillator: NodeId, at: f64) -> Result<(), BackendError> {
        self.backend.start(oscillator, at)
    }

    pub fn stop(&mut self, oscillator: NodeId, at: f64) -> Result<(), BackendError> {
        self.backend.stop(oscillator, at)
    }

    pub fn trigger_attack(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError> {
        self.backend.trigger_attack(envelope, at)
    }

    pub fn trigger_release(&mut self, envelope: NodeId, at: f64) -> Result<(), BackendError> {
        self.backend.trigger_release(envelope, at)
    }

    pub fn ramp(
        &mut self,
        node: NodeId,
        param: Param,
        value: f64,
        at: f64,
        duration: f64,
    ) -> Result<(), BackendError> {
        self.backend.ramp_param(node, param, value, at, duration)
    }

    pub fn master(&self) -> NodeId {
        self.backend.master()
    }

    /// Keep everything allocated so far and hand over the node list
    pub fn commit(mut self) -> Vec<NodeId> {
        self.committed = true;
        std::mem::take(&mut self.nodes)
    }
}

impl Drop for GraphBuilder<'_> {
    fn drop(&mut self) {
        if self.committed || self.nodes.is_empty() {
            return;
        }
        log::debug!(
            target: "driftwave",
            "rolling back {} nodes of an unfinished subgraph",
            self.nodes.len()
        );
        for &node in self.nodes.iter().rev() {
            let _ = self.backend.dispose(node);
        }
    }
}

/// What an engine hands back after building its subgraph
pub struct Built {
    pub engine: EngineState,
    pub envelopes: Vec<NodeId>,
    pub oscillators: Vec<NodeId>,
    /// Longest release among the envelopes
    pub release: f64,
}

/// Envelope of a voice after applying articulation
pub fn articulate(envelope: Adsr, modifiers: VoiceModifiers) -> Adsr {
    let envelope = envelope.sanitized();
    if modifiers.accent {
        Adsr {
            decay: envelope.decay * 0.5,
            ..envelope
        }
    } else {
        envelope
    }
}

/// Owner of every live voice
#[derive(Default)]
pub struct VoiceManager {
    voices: SlotMap<VoiceId, Voice>,
    grains_in_flight: usize,
}

impl VoiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.get(id)
    }

    pub fn contains(&self, id: VoiceId) -> bool {
        self.voices.contains_key(id)
    }

    pub fn is_active(&self, id: VoiceId) -> bool {
        self.voices.get(id).map(Voice::is_active).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VoiceId, &Voice)> {
        self.voices.iter()
    }

    /// Voices not yet disposed, releasing ones included
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Voices still sounding
    pub fn active_count(&self) -> usize {
        self.voices.values().filter(|v| v.is_active()).count()
    }

    /// Grains started but not yet expired
    pub fn grains_in_flight(&self) -> usize {
        self.grains_in_flight
    }

    fn oldest_active(&self) -> Option<VoiceId> {
        self.voices
            .iter()
            .filter(|(_, v)| v.is_active())
            .min_by(|(_, a), (_, b)| a.started_at.total_cmp(&b.started_at))
            .map(|(id, _)| id)
    }

    /// Build, connect and start a voice
    pub fn start_voice(
        &mut self,
        ctx: &mut Context<'_>,
        request: VoiceRequest,
    ) -> Result<VoiceId, SynthError> {
        if !ctx.backend.is_ready() {
            log::warn!(target: "driftwave", "voice requested before the audio backend is ready");
            return Err(SynthError::BackendNotReady);
        }
        let frequency = validate_frequency(request.frequency)?;
        if !(0.0..=1.0).contains(&request.velocity) {
            return Err(SynthError::InvalidVelocity(request.velocity));
        }

        if self.active_count() >= ctx.config.max_voices {
            if let Some(oldest) = self.oldest_active() {
                log::debug!(target: "driftwave", "voice limit reached, stealing oldest voice");
                self.stop_voice(ctx, oldest);
            }
        }

        let accent = if request.modifiers.accent {
            ctx.config.accent_boost
        } else {
            1.0
        };
        let peak_gain = ctx.config.master_volume * request.velocity * accent;
        let now = ctx.now();

        let mut builder = GraphBuilder::new(&mut *ctx.backend);
        let output = builder.add(NodeKind::gain(peak_gain))?;
        let built = match request.kind {
            VoiceKind::Subtractive => subtractive::build(
                &mut builder,
                &ctx.config.subtractive,
                frequency,
                request.modifiers,
                output,
                now,
            ),
            VoiceKind::Granular => granular::build(
                &mut builder,
                articulate(ctx.config.envelope, request.modifiers),
                output,
                now,
            ),
            VoiceKind::Gendy => gendy::build(
                &mut builder,
                &ctx.config.gendy,
                articulate(ctx.config.envelope, request.modifiers),
                frequency,
                output,
                now,
            ),
            VoiceKind::Chaos => chaos::build(
                &mut builder,
                &ctx.config.chaos,
                articulate(ctx.config.envelope, request.modifiers),
                frequency,
                output,
                now,
            ),
        }?;
        let master = builder.master();
        builder.connect(output, Port::signal(master))?;
        let nodes = builder.commit();

        let release_tail = match request.kind {
            VoiceKind::Granular => built.release.max(MAX_GRAIN_SIZE_MS / 1000.0),
            _ => built.release,
        } + DISPOSE_MARGIN;

        let voice = Voice {
            kind: request.kind,
            owner: request.owner,
            frequency,
            velocity: request.velocity,
            modifiers: request.modifiers,
            state: VoiceState::Active,
            started_at: now,
            peak_gain,
            output,
            envelopes: built.envelopes,
            oscillators: built.oscillators,
            nodes,
            release_tail,
            engine: built.engine,
            note_off: None,
        };
        let id = self.voices.insert(voice);
        self.arm(ctx, id, request.kind);

        log::debug!(
            target: "driftwave",
            "started {:?} voice at {:.2} Hz (gain {:.3})",
            request.kind,
            frequency,
            peak_gain
        );
        Ok(id)
    }

    /// Queue the first tick of the voice's engine loop
    fn arm(&mut self, ctx: &mut Context<'_>, id: VoiceId, kind: VoiceKind) {
        match kind {
            VoiceKind::Subtractive => {}
            VoiceKind::Granular => {
                ctx.scheduler.schedule_after(0.0, Task::Grain { voice: id });
            }
            VoiceKind::Gendy => {
                let delay = gendy::regeneration_interval(ctx.rng);
                ctx.scheduler
                    .schedule_after(delay, Task::GendyRegenerate { voice: id });
            }
            VoiceKind::Chaos => {
                ctx.scheduler
                    .schedule_after(chaos::STEP_INTERVAL, Task::ChaosStep { voice: id });
            }
        }
    }

    /// Release a voice after `delay` seconds
    pub fn schedule_note_off(&mut self, ctx: &mut Context<'_>, id: VoiceId, delay: f64) {
        if let Some(voice) = self.voices.get_mut(id) {
            if let Some(previous) = voice.note_off.take() {
                ctx.scheduler.cancel(previous);
            }
            voice.note_off = Some(
                ctx.scheduler
                    .schedule_after(delay, Task::NoteOff { voice: id }),
            );
        }
    }

    /// Release a voice and queue its disposal
    ///
    /// Returns false if the voice was already released or disposed.
    pub fn stop_voice(&mut self, ctx: &mut Context<'_>, id: VoiceId) -> bool {
        let Some(voice) = self.voices.get_mut(id) else {
            return false;
        };
        if voice.state != VoiceState::Active {
            return false;
        }

        let now = ctx.now();
        for &envelope in &voice.envelopes {
            if let Err(e) = ctx.backend.trigger_release(envelope, now) {
                log::warn!(target: "driftwave", "release failed: {}", e);
            }
        }
        voice.state = VoiceState::Releasing;
        if let Some(pending) = voice.note_off.take() {
            ctx.scheduler.cancel(pending);
        }
        ctx.scheduler
            .schedule_after(voice.release_tail, Task::Dispose { voice: id });
        true
    }

    /// Release every voice; returns how many were sounding
    pub fn stop_all(&mut self, ctx: &mut Context<'_>) -> usize {
        self.stop_where(ctx, |_| true)
    }

    /// Release every sounding voice matching the predicate
    pub fn stop_where(&mut self, ctx: &mut Context<'_>, pred: impl Fn(&Voice) -> bool) -> usize {
        let ids: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|(_, v)| v.is_active() && pred(v))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter()
            .filter(|&id| self.stop_voice(ctx, id))
            .count()
    }

    /// Move a sounding voice to a new pitch without retriggering it
    pub fn glide(
        &mut self,
        ctx: &mut Context<'_>,
        id: VoiceId,
        frequency: f64,
        time: f64,
        modifiers: VoiceModifiers,
    ) -> bool {
        let Some(voice) = self.voices.get_mut(id) else {
            return false;
        };
        if !voice.is_active() {
            return false;
        }

        let now = ctx.now();
        voice.frequency = frequency;
        voice.modifiers = modifiers;
        for &oscillator in &voice.oscillators {
            let target = match &voice.engine {
                EngineState::Chaos(c) if oscillator == c.modulator => continue,
                _ => frequency,
            };
            if let Err(e) = ctx
                .backend
                .ramp_param(oscillator, Param::Frequency, target, now, time)
            {
                log::warn!(target: "driftwave", "glide failed: {}", e);
            }
        }
        if let EngineState::Chaos(c) = &voice.engine {
            c.retune(ctx.backend, &ctx.config.chaos, frequency, now, time);
        }

        let accent = if modifiers.accent {
            ctx.config.accent_boost
        } else {
            1.0
        };
        let peak_gain = ctx.config.master_volume * voice.velocity * accent;
        if peak_gain != voice.peak_gain {
            voice.peak_gain = peak_gain;
            if let Err(e) = ctx
                .backend
                .ramp_param(voice.output, Param::Gain, peak_gain, now, time)
            {
                log::warn!(target: "driftwave", "glide gain ramp failed: {}", e);
            }
        }
        true
    }

    /// Free a voice's nodes. Returns false if it was already gone.
    pub fn dispose(&mut self, ctx: &mut Context<'_>, id: VoiceId) -> bool {
        let Some(voice) = self.voices.remove(id) else {
            return false;
        };
        if let Some(pending) = voice.note_off {
            ctx.scheduler.cancel(pending);
        }
        let now = ctx.now();
        for &oscillator in &voice.oscillators {
            let _ = ctx.backend.stop(oscillator, now);
        }
        let _ = ctx.backend.disconnect(voice.output);
        for &node in voice.nodes.iter().rev() {
            if let Err(e) = ctx.backend.dispose(node) {
                log::warn!(target: "driftwave", "dispose failed: {}", e);
            }
        }
        log::debug!(target: "driftwave", "disposed {:?} voice", voice.kind);
        true
    }

    /// Run a voice-related task
    pub fn run_task(&mut self, ctx: &mut Context<'_>, task: Task) {
        match task {
            Task::NoteOff { voice } => {
                if let Some(v) = self.voices.get_mut(voice) {
                    v.note_off = None;
                }
                self.stop_voice(ctx, voice);
            }
            Task::Dispose { voice } => {
                self.dispose(ctx, voice);
            }
            Task::Grain { voice } => self.on_grain(ctx, voice),
            Task::GrainExpire {
                voice,
                oscillator,
                envelope,
            } => {
                let _ = ctx.backend.dispose(oscillator);
                let _ = ctx.backend.dispose(envelope);
                self.grains_in_flight = self.grains_in_flight.saturating_sub(1);
                if let Some(EngineState::Granular(g)) =
                    self.voices.get_mut(voice).map(|v| &mut v.engine)
                {
                    g.in_flight = g.in_flight.saturating_sub(1);
                }
            }
            Task::GendyRegenerate { voice } => {
                let Some(v) = self.voices.get_mut(voice) else {
                    return;
                };
                if !v.is_active() {
                    return;
                }
                if let Err(e) = gendy::regenerate(ctx, v, voice) {
                    log::warn!(target: "driftwave", "gendy regeneration failed: {}", e);
                }
                let delay = gendy::regeneration_interval(ctx.rng);
                ctx.scheduler
                    .schedule_after(delay, Task::GendyRegenerate { voice });
            }
            Task::GendyRetire {
                voice,
                oscillator,
                fade,
            } => {
                // A disposed voice already freed these with the rest of its nodes
                let Some(v) = self.voices.get_mut(voice) else {
                    return;
                };
                v.forget(&[oscillator, fade]);
                let now = ctx.now();
                let _ = ctx.backend.stop(oscillator, now);
                let _ = ctx.backend.dispose(oscillator);
                let _ = ctx.backend.dispose(fade);
            }
            Task::ChaosStep { voice } => {
                let Some(v) = self.voices.get_mut(voice) else {
                    return;
                };
                chaos::step(ctx, v);
                ctx.scheduler
                    .schedule_after(chaos::STEP_INTERVAL, Task::ChaosStep { voice });
            }
            Task::SequencerTick { .. } => {}
        }
    }

    fn on_grain(&mut self, ctx: &mut Context<'_>, id: VoiceId) {
        let Some(voice) = self.voices.get_mut(id) else {
            return;
        };
        if !voice.is_active() {
            return;
        }
        match granular::spawn_grain(ctx, voice, id) {
            Ok(()) => self.grains_in_flight += 1,
            Err(e) => log::warn!(target: "driftwave", "grain allocation failed: {}", e),
        }
        let delay = granular::next_interval(&ctx.config.granular, ctx.rng);
        ctx.scheduler.schedule_after(delay, Task::Grain { voice: id });
    }
}
