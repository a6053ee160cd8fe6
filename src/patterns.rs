//! Pattern Library
//!
//! Ready-made 16-step sequences plus a random pattern generator.
//!
//! ```
//! use driftwave::patterns::PatternLibrary;
//!
//! let pattern = PatternLibrary::get("classic1").unwrap();
//! assert_eq!(pattern.steps[0], Some("C3"));
//! assert_eq!(pattern.accents, &[0, 8]);
//! ```

use crate::note::Note;
use crate::sequencer::{Sequence, STEPS};
use rand::seq::SliceRandom;
use rand::Rng;

/// Chance a random step holds a note
pub const NOTE_PROBABILITY: f64 = 0.6;

/// Chance a random note is accented
pub const ACCENT_PROBABILITY: f64 = 0.25;

/// Chance a random note slides in
pub const SLIDE_PROBABILITY: f64 = 0.15;

/// Semitone offsets of the minor pentatonic scale
const MINOR_PENTATONIC: [u8; 5] = [0, 3, 5, 7, 10];

/// A named 16-step sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    pub name: &'static str,
    pub description: &'static str,
    pub steps: [Option<&'static str>; STEPS],
    pub accents: &'static [usize],
    pub slides: &'static [usize],
}

impl Pattern {
    /// Build an editable sequence from the pattern
    pub fn to_sequence(&self) -> Sequence {
        let mut sequence = Sequence::new();
        for (index, name) in self.steps.iter().enumerate() {
            let note = name.and_then(|n| n.parse::<Note>().ok());
            let _ = sequence.set(index, note);
        }
        for &index in self.accents {
            let _ = sequence.toggle_accent(index);
        }
        for &index in self.slides {
            let _ = sequence.toggle_slide(index);
        }
        sequence
    }
}

#[rustfmt::skip]
const PATTERNS: &[Pattern] = &[
    Pattern {
        name: "classic1",
        description: "Rising and falling C major arpeggio with two slides",
        steps: [
            Some("C3"), None, Some("E3"), None,
            Some("G3"), None, Some("C4"), None,
            Some("G3"), None, Some("E3"), None,
            Some("C3"), None, None, None,
        ],
        accents: &[0, 8],
        slides: &[4, 12],
    },
    Pattern {
        name: "classic2",
        description: "Syncopated minor bass line",
        steps: [
            Some("C3"), Some("C3"), None, Some("C4"),
            None, Some("A#2"), None, Some("G2"),
            Some("C3"), None, Some("D#3"), None,
            Some("F3"), None, Some("G3"), None,
        ],
        accents: &[0, 8, 14],
        slides: &[3, 12],
    },
    Pattern {
        name: "acid",
        description: "Busy sixteenths around A2 with octave jumps",
        steps: [
            Some("A2"), Some("A2"), Some("A3"), Some("A2"),
            Some("C3"), Some("A2"), Some("G3"), Some("A2"),
            Some("A2"), Some("E3"), Some("A2"), Some("D3"),
            Some("A2"), Some("A3"), Some("G2"), Some("C3"),
        ],
        accents: &[0, 6, 13],
        slides: &[2, 6, 9, 13],
    },
    Pattern {
        name: "arpeggio",
        description: "C major then A minor broken chords",
        steps: [
            Some("C3"), Some("E3"), Some("G3"), Some("C4"),
            Some("E4"), Some("C4"), Some("G3"), Some("E3"),
            Some("A2"), Some("C3"), Some("E3"), Some("A3"),
            Some("C4"), Some("A3"), Some("E3"), Some("C3"),
        ],
        accents: &[0, 8],
        slides: &[],
    },
    Pattern {
        name: "minimal",
        description: "Sparse low pulse",
        steps: [
            Some("C2"), None, None, None,
            Some("C2"), None, None, Some("C3"),
            None, None, Some("C2"), None,
            None, None, Some("D#2"), None,
        ],
        accents: &[0],
        slides: &[7],
    },
];

/// Built-in patterns
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternLibrary;

impl PatternLibrary {
    /// Look up a pattern by name (case-insensitive)
    pub fn get(name: &str) -> Option<&'static Pattern> {
        PATTERNS
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn list() -> &'static [Pattern] {
        PATTERNS
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        PATTERNS.iter().map(|p| p.name)
    }
}

/// Notes of C minor pentatonic from C2 up to C4
pub fn pentatonic_scale() -> Vec<Note> {
    let Some(root) = Note::new(36) else {
        return Vec::new();
    };
    (0i32..=24)
        .filter(|semitone| MINOR_PENTATONIC.contains(&((semitone % 12) as u8)))
        .filter_map(|semitone| root.transpose(semitone))
        .collect()
}

/// Random C minor pentatonic sequence
pub fn random_sequence<R: Rng + ?Sized>(rng: &mut R) -> Sequence {
    let scale = pentatonic_scale();
    let mut sequence = Sequence::new();
    for index in 0..STEPS {
        if !rng.gen_bool(NOTE_PROBABILITY) {
            continue;
        }
        let note = scale.choose(rng).copied();
        let _ = sequence.set(index, note);
        if rng.gen_bool(ACCENT_PROBABILITY) {
            let _ = sequence.toggle_accent(index);
        }
        if rng.gen_bool(SLIDE_PROBABILITY) {
            let _ = sequence.toggle_slide(index);
        }
    }
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_all_patterns_parse() {
        for pattern in PatternLibrary::list() {
            let sequence = pattern.to_sequence();
            let expected = pattern.steps.iter().filter(|s| s.is_some()).count();
            assert_eq!(sequence.note_count(), expected, "{}", pattern.name);
        }
    }

    #[test]
    fn test_modifiers_sit_on_notes() {
        for pattern in PatternLibrary::list() {
            for &i in pattern.accents.iter().chain(pattern.slides) {
                assert!(i < STEPS);
                assert!(pattern.steps[i].is_some(), "{} step {}", pattern.name, i);
            }
        }
    }

    #[test]
    fn test_classic1() {
        let sequence = PatternLibrary::get("classic1").unwrap().to_sequence();
        let names: Vec<Option<String>> = (0..STEPS)
            .map(|i| sequence.note(i).map(|n| n.to_string()))
            .collect();
        assert_eq!(names[0].as_deref(), Some("C3"));
        assert_eq!(names[6].as_deref(), Some("C4"));
        assert_eq!(names[12].as_deref(), Some("C3"));
        assert_eq!(names[13], None);
        assert_eq!(sequence.accents().collect::<Vec<_>>(), vec![0, 8]);
        assert_eq!(sequence.slides().collect::<Vec<_>>(), vec![4, 12]);
    }

    #[test]
    fn test_lookup() {
        assert!(PatternLibrary::get("ACID").is_some());
        assert!(PatternLibrary::get("nope").is_none());
        assert_eq!(PatternLibrary::names().count(), 5);
    }

    #[test]
    fn test_scale() {
        let scale = pentatonic_scale();
        assert_eq!(scale.first().map(|n| n.to_string()).as_deref(), Some("C2"));
        assert_eq!(scale.last().map(|n| n.to_string()).as_deref(), Some("C4"));
        assert_eq!(scale.len(), 11);
    }

    #[test]
    fn test_random_sequence() {
        let scale = pentatonic_scale();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut notes = 0;
        for _ in 0..200 {
            let sequence = random_sequence(&mut rng);
            for i in 0..STEPS {
                match sequence.note(i) {
                    Some(note) => assert!(scale.contains(&note)),
                    None => {
                        assert!(!sequence.is_accent(i));
                        assert!(!sequence.is_slide(i));
                    }
                }
            }
            notes += sequence.note_count();
        }
        // 200 patterns * 16 steps * 0.6
        assert!((1800..=2040).contains(&notes), "{} notes", notes);
    }
}
