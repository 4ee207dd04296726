//! Global parameter management
//!
//! Centralized singleton for the player's tunable constants.
//! Read-frequently, write-rarely access pattern using RwLock.
//!
//! Several of these values (refill attempt budgets, zero-yield scan limit,
//! predecode patience) are empirically tuned playback pacing constants with no
//! closed-form derivation; they are kept here as runtime-adjustable parameters
//! instead of being baked into the state machine.
//!
//! # Usage
//!
//! ```rust
//! use pwmplay::params::PARAMS;
//!
//! // Read (fast, uncontended)
//! let clock = *PARAMS.pwm_clock_hz.read().unwrap();
//!
//! // Write (rare, initialization only)
//! *PARAMS.pwm_clock_hz.write().unwrap() = 133_000_000;
//! ```

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// Global parameters singleton
///
/// Initialized once with defaults, accessed everywhere.
pub static PARAMS: Lazy<GlobalParams> = Lazy::new(GlobalParams::default);

/// Global parameter storage
///
/// All parameters stored with RwLock for thread-safe access.
/// Readers don't block each other (shared read lock).
pub struct GlobalParams {
    /// System clock feeding the PWM slice
    ///
    /// Default: 125 MHz (RP2040 clk_sys)
    pub pwm_clock_hz: RwLock<u32>,

    /// Frames per DMA batch (per ping-pong slot)
    ///
    /// Valid range: [64, 4096]
    /// Default: 256 frames (~5.8ms @ 44.1kHz)
    pub batch_frames: RwLock<usize>,

    /// Ring buffer latency window when the host does not pass buffer_ms
    ///
    /// Default: 225 ms (~48 KiB @ 44.1kHz stereo)
    pub default_buffer_ms: RwLock<u32>,

    /// High-water mark as a fraction of ring capacity
    ///
    /// Valid range: (0.0, 1.0)
    /// Default: 0.9 — full capacity is never targeted, leaving headroom
    /// for a decode burst that lands while the provider is draining.
    pub high_water_fraction: RwLock<f32>,

    /// Refill timer period
    ///
    /// Default: 3 ms — deliberately not a multiple of the batch period so
    /// refill checks don't phase-lock with DMA completions.
    pub refill_period_ms: RwLock<u64>,

    /// Refill pass attempt budget when occupancy is critically low
    ///
    /// Default: 96 decode attempts
    pub refill_attempts_low: RwLock<u32>,

    /// Refill pass attempt budget when merely topping up
    ///
    /// Default: 32 decode attempts
    pub refill_attempts_topup: RwLock<u32>,

    /// Occupancy (in frames) below which a refill pass uses the larger budget
    ///
    /// Default: 256 frames
    pub low_water_frames: RwLock<usize>,

    /// Zero-yield decode attempts tolerated during the initial predecode
    ///
    /// The decoder may need to skip non-frame bytes before producing PCM;
    /// each zero-yield typically advances the stream by about one byte.
    /// Default: 1024
    pub zero_scan_limit: RwLock<u32>,

    /// Wall-clock patience for the initial predecode loop
    ///
    /// Default: 150 ms — playback starts even on malformed/unsynced input.
    pub predecode_patience_ms: RwLock<u64>,

    /// Extra synchronous decode attempts to build a pre-start cushion
    ///
    /// Default: 256
    pub cushion_attempts: RwLock<u32>,

    /// Decode scratch size in frames (one compressed frame's worth of PCM)
    ///
    /// Default: 1152 frames (one MPEG-1 Layer III frame)
    pub scratch_frames: RwLock<usize>,

    /// Hardware-safe output sample rate clamp
    ///
    /// Defaults: 8000..=192000 Hz
    pub sample_rate_min_hz: RwLock<u32>,
    pub sample_rate_max_hz: RwLock<u32>,

    /// Rate-scale percent clamp for set_rate()
    ///
    /// Defaults: 50.0..=200.0
    pub rate_scale_min_percent: RwLock<f32>,
    pub rate_scale_max_percent: RwLock<f32>,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            pwm_clock_hz: RwLock::new(125_000_000),
            batch_frames: RwLock::new(256),
            default_buffer_ms: RwLock::new(225),
            high_water_fraction: RwLock::new(0.9),
            refill_period_ms: RwLock::new(3),
            refill_attempts_low: RwLock::new(96),
            refill_attempts_topup: RwLock::new(32),
            low_water_frames: RwLock::new(256),
            zero_scan_limit: RwLock::new(1024),
            predecode_patience_ms: RwLock::new(150),
            cushion_attempts: RwLock::new(256),
            scratch_frames: RwLock::new(1152),
            sample_rate_min_hz: RwLock::new(8_000),
            sample_rate_max_hz: RwLock::new(192_000),
            rate_scale_min_percent: RwLock::new(50.0),
            rate_scale_max_percent: RwLock::new(200.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = GlobalParams::default();
        assert_eq!(*p.pwm_clock_hz.read().unwrap(), 125_000_000);
        assert_eq!(*p.batch_frames.read().unwrap(), 256);
        assert!(*p.high_water_fraction.read().unwrap() < 1.0);
        assert!(
            *p.refill_attempts_low.read().unwrap() > *p.refill_attempts_topup.read().unwrap(),
            "near-underrun budget must exceed the top-up budget"
        );
    }

    #[test]
    fn test_singleton_access() {
        let clock = *PARAMS.pwm_clock_hz.read().unwrap();
        assert!(clock >= 1_000_000);
    }
}
