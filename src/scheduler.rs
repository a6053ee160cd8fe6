//! Deferred Task Scheduling
//!
//! Everything that happens "later" in the core (sequencer steps, grain
//! spawning, Gendy regeneration, chaos integration, note-offs and disposal)
//! is a [`Task`] value placed on a [`Scheduler`]. The host drives time; due
//! tasks run to completion in time order, FIFO among equal times.
//!
//! Tasks refer to voices by generational [`VoiceId`], so a task that outlives
//! its voice simply finds nothing when it runs.

use crate::backend::NodeId;
use crate::voice::VoiceId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Identifier returned by [`Scheduler::schedule_at`], usable with [`Scheduler::cancel`]
pub type TaskId = u64;

/// Deferred unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Resolve the next sequencer step; `run` identifies the start/stop cycle
    SequencerTick { run: u64 },
    /// Release a voice
    NoteOff { voice: VoiceId },
    /// Free a released voice's nodes
    Dispose { voice: VoiceId },
    /// Spawn the next grain of a granular voice
    Grain { voice: VoiceId },
    /// A finished grain's oscillator and envelope
    GrainExpire {
        voice: VoiceId,
        oscillator: NodeId,
        envelope: NodeId,
    },
    /// Generate and crossfade to a new Gendy waveform
    GendyRegenerate { voice: VoiceId },
    /// Dispose a faded-out Gendy oscillator
    GendyRetire {
        voice: VoiceId,
        oscillator: NodeId,
        fade: NodeId,
    },
    /// Advance a chaos voice's integration by one step
    ChaosStep { voice: VoiceId },
}

/// A task popped from the scheduler, with the time it was due
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub id: TaskId,
    pub at: f64,
    pub task: Task,
}

/// Timeline of deferred tasks
pub trait Scheduler {
    /// Current time in seconds
    fn now(&self) -> f64;

    /// Queue a task at an absolute time (clamped to now)
    fn schedule_at(&mut self, at: f64, task: Task) -> TaskId;

    /// Queue a task `delay` seconds from now
    fn schedule_after(&mut self, delay: f64, task: Task) -> TaskId {
        let at = self.now() + delay.max(0.0);
        self.schedule_at(at, task)
    }

    /// Cancel a queued task. Returns false if it already ran or was cancelled.
    fn cancel(&mut self, id: TaskId) -> bool;

    /// Pop the earliest task due at or before `until`, moving the clock to its time
    fn next_due(&mut self, until: f64) -> Option<Scheduled>;

    /// Move the clock forward to `time` (never backwards)
    fn advance_to(&mut self, time: f64);

    /// Number of tasks still queued
    fn pending(&self) -> usize;
}

struct Entry {
    at: f64,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest entry first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .total_cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deterministic scheduler driven entirely by [`Scheduler::advance_to`]
///
/// Used by hosts that pump time from an audio callback, and by tests.
pub struct VirtualClock {
    now: f64,
    next_id: TaskId,
    queue: BinaryHeap<Entry>,
    live: HashSet<TaskId>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            next_id: 0,
            queue: BinaryHeap::new(),
            live: HashSet::new(),
        }
    }

    /// Time of the earliest live task, if any
    pub fn peek_time(&mut self) -> Option<f64> {
        self.discard_cancelled();
        self.queue.peek().map(|e| e.at)
    }

    fn discard_cancelled(&mut self) {
        while let Some(entry) = self.queue.peek() {
            if self.live.contains(&entry.seq) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for VirtualClock {
    fn now(&self) -> f64 {
        self.now
    }

    fn schedule_at(&mut self, at: f64, task: Task) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let at = if at.is_finite() { at.max(self.now) } else { self.now };
        self.queue.push(Entry { at, seq: id, task });
        self.live.insert(id);
        id
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        self.live.remove(&id)
    }

    fn next_due(&mut self, until: f64) -> Option<Scheduled> {
        self.discard_cancelled();
        if self.queue.peek()?.at > until {
            return None;
        }
        let entry = self.queue.pop()?;
        self.live.remove(&entry.seq);
        self.now = self.now.max(entry.at);
        Some(Scheduled {
            id: entry.seq,
            at: entry.at,
            task: entry.task,
        })
    }

    fn advance_to(&mut self, time: f64) {
        if time.is_finite() && time > self.now {
            self.now = time;
        }
    }

    fn pending(&self) -> usize {
        self.live.len()
    }
}
