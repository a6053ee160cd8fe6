//! Error types
//!
//! Two layers of failure: [`BackendError`] is what an [`AudioBackend`]
//! reports for a single graph operation, [`SynthError`] is what the public
//! surface returns. Neither is ever fatal; the worst outcome is silence.
//!
//! [`AudioBackend`]: crate::backend::AudioBackend

use core::fmt;

/// Failure reported by an audio backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The audio context has not been started yet
    NotReady,
    /// The node handle does not refer to a live node
    InvalidNode,
    /// The node exists but does not accept that input or parameter
    InvalidPort,
    /// The connection would close a signal loop
    CycleDetected,
    /// The backend could not allocate another node
    Exhausted,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NotReady => write!(f, "Audio backend not ready"),
            BackendError::InvalidNode => write!(f, "Invalid node"),
            BackendError::InvalidPort => write!(f, "Invalid port"),
            BackendError::CycleDetected => write!(f, "Connection would create a cycle"),
            BackendError::Exhausted => write!(f, "Backend node capacity exhausted"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Error returned by the synthesis surface
#[derive(Debug, Clone, PartialEq)]
pub enum SynthError {
    BackendNotReady,
    InvalidFrequency(f64),
    InvalidVelocity(f64),
    InvalidNote(String),
    InvalidStep(usize),
    UnknownEngine(String),
    UnknownPattern(String),
    InvalidConfig(String),
    Backend(BackendError),
}

impl fmt::Display for SynthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthError::BackendNotReady => write!(f, "Audio backend not ready"),
            SynthError::InvalidFrequency(hz) => write!(f, "Frequency out of range: {} Hz", hz),
            SynthError::InvalidVelocity(v) => write!(f, "Velocity out of range: {}", v),
            SynthError::InvalidNote(note) => write!(f, "Invalid note: {}", note),
            SynthError::InvalidStep(index) => write!(f, "Step index out of range: {}", index),
            SynthError::UnknownEngine(name) => write!(f, "Unknown engine: {}", name),
            SynthError::UnknownPattern(name) => write!(f, "Unknown pattern: {}", name),
            SynthError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            SynthError::Backend(e) => write!(f, "Backend error: {}", e),
        }
    }
}

impl std::error::Error for SynthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SynthError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for SynthError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotReady => SynthError::BackendNotReady,
            other => SynthError::Backend(other),
        }
    }
}

pub type Result<T, E = SynthError> = core::result::Result<T, E>;
