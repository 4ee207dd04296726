//! Playback lifecycle states

use serde::{Deserialize, Serialize};

/// Player lifecycle state.
///
/// Transitions:
/// - `Idle -> Loaded` via `load()`
/// - `Loaded -> Playing` via `play()`
/// - `Playing -> Eof` when the decoder is exhausted and the ring drains
/// - `Eof -> Loaded`/`Playing` via `load()`/`play()` (rewinds the stream)
/// - any state `-> Idle` via `stop()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// No stream loaded
    Idle,

    /// Stream opened and validated, output not running
    Loaded,

    /// Output running, refill active
    Playing,

    /// Stream fully decoded and drained; output still configured
    Eof,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlayerState::Idle => "idle",
            PlayerState::Loaded => "loaded",
            PlayerState::Playing => "playing",
            PlayerState::Eof => "eof",
        };
        write!(f, "{}", s)
    }
}
