//! Notes and Pitch
//!
//! Note names use scientific pitch notation (`C4` = MIDI 60 = 261.63 Hz,
//! `A4` = 440 Hz). Sharps are written `#`, flats `b`.

use crate::error::SynthError;
use core::fmt;
use core::str::FromStr;

/// Lowest frequency a voice will be started at
pub const MIN_FREQUENCY: f64 = 16.0;

/// Highest frequency a voice will be started at
pub const MAX_FREQUENCY: f64 = 20_000.0;

const NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A MIDI note number (0–127)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Note(u8);

impl Note {
    pub fn new(midi: u8) -> Option<Self> {
        (midi <= 127).then_some(Self(midi))
    }

    pub fn midi(self) -> u8 {
        self.0
    }

    pub fn frequency(self) -> f64 {
        midi_to_frequency(self.0 as f64)
    }

    /// Transpose by semitones, `None` if the result leaves the MIDI range
    pub fn transpose(self, semitones: i32) -> Option<Self> {
        let midi = (self.0 as i32).checked_add(semitones)?;
        u8::try_from(midi).ok().and_then(Self::new)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octave = self.0 as i32 / 12 - 1;
        write!(f, "{}{}", NAMES[self.0 as usize % 12], octave)
    }
}

impl FromStr for Note {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SynthError::InvalidNote(s.to_string());
        let s = s.trim();
        let mut chars = s.chars();

        let letter = chars.next().ok_or_else(invalid)?;
        let base: i32 = match letter.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(invalid()),
        };

        let rest = chars.as_str();
        let (accidental, octave) = match rest.chars().next() {
            Some('#') => (1, &rest[1..]),
            Some('b') => (-1, &rest[1..]),
            _ => (0, rest),
        };

        let octave: i32 = octave.parse().map_err(|_| invalid())?;
        let midi = octave
            .checked_add(1)
            .and_then(|o| o.checked_mul(12))
            .and_then(|m| m.checked_add(base + accidental));
        midi.and_then(|m| u8::try_from(m).ok())
            .and_then(Note::new)
            .ok_or_else(invalid)
    }
}

/// Something that can be played: a note name, a MIDI number or a frequency
#[derive(Debug, Clone, PartialEq)]
pub enum Pitch {
    Note(Note),
    Frequency(f64),
    Name(String),
}

impl Pitch {
    /// Resolve to a frequency in Hz, validating the audible range
    pub fn resolve(&self) -> Result<f64, SynthError> {
        let hz = match self {
            Pitch::Note(note) => note.frequency(),
            Pitch::Frequency(hz) => *hz,
            Pitch::Name(name) => name.parse::<Note>()?.frequency(),
        };
        validate_frequency(hz)
    }
}

impl From<Note> for Pitch {
    fn from(note: Note) -> Self {
        Pitch::Note(note)
    }
}

impl From<f64> for Pitch {
    fn from(hz: f64) -> Self {
        Pitch::Frequency(hz)
    }
}

impl From<&str> for Pitch {
    fn from(name: &str) -> Self {
        Pitch::Name(name.to_string())
    }
}

impl From<u8> for Pitch {
    fn from(midi: u8) -> Self {
        match Note::new(midi) {
            Some(note) => Pitch::Note(note),
            None => Pitch::Frequency(f64::NAN),
        }
    }
}

/// Reject frequencies a voice cannot sensibly be started at
pub fn validate_frequency(hz: f64) -> Result<f64, SynthError> {
    if hz.is_finite() && (MIN_FREQUENCY..=MAX_FREQUENCY).contains(&hz) {
        Ok(hz)
    } else {
        Err(SynthError::InvalidFrequency(hz))
    }
}

/// Convert a (fractional) MIDI note number to Hz
#[inline]
pub fn midi_to_frequency(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

/// Shift a frequency by cents
#[inline]
pub fn detune(hz: f64, cents: f64) -> f64 {
    hz * 2f64.powf(cents / 1200.0)
}
