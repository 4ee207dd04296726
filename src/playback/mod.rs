//! Playback state machine, ring buffer, and tone generator

pub mod engine;
pub mod ring_buffer;
pub mod state;
pub mod tone;

pub use engine::{Player, PlayerConfig, PlayerStats};
pub use ring_buffer::PcmRingBuffer;
pub use state::PlayerState;
pub use tone::ToneGenerator;
