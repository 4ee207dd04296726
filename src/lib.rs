//! # PWM Audio Player Library (pwmplay)
//!
//! Streaming audio playback through a two-channel PWM output stage paced by
//! DMA, as found on microcontroller-class hardware.
//!
//! **Purpose:** Decode audio streams, buffer PCM through a lock-free ring,
//! and feed ping-pong DMA batches to a PWM backend at a fitted sample rate.
//!
//! **Architecture:** Pull pipeline — decoder -> ring buffer -> provider
//! callback -> output engine — driven by a [`playback::Player`] state
//! machine. Hardware sits behind the [`audio::PwmBackend`] trait; the
//! in-crate loopback backend drives the same pipeline in tests.

pub mod audio;
pub mod error;
pub mod params;
pub mod playback;

pub use error::{Error, Result};
pub use playback::{Player, PlayerConfig, PlayerState, PlayerStats};
