//! Core audio data types
//!
//! Defines the small value types shared across the output engine and the
//! playback state machine: output pin assignment, stream metadata, the Q16
//! rate-scale multiplier, and the PCM-to-duty-level mapping.

use serde::{Deserialize, Serialize};

/// GPIO pin pair driving the left/right PWM channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPins {
    /// Left channel pin
    pub left: u8,

    /// Right channel pin
    pub right: u8,
}

impl OutputPins {
    pub fn new(left: u8, right: u8) -> Self {
        Self { left, right }
    }
}

/// Stream metadata reported by a decoder at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Nominal sample rate in Hz
    pub sample_rate: u32,

    /// Channel count (clamped to 1 or 2 by the state machine)
    pub channels: u16,
}

/// Fixed-point playback rate multiplier, Q16 (65536 = 100%).
///
/// Stored by `set_rate()` and applied to the nominal sample rate on the next
/// `play()`; it does not affect an already-running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateScale(u32);

impl RateScale {
    /// 100% — nominal playback rate
    pub const UNITY: RateScale = RateScale(1 << 16);

    /// Build from a percentage, clamping to the given range.
    ///
    /// 100.0 = normal, 90.0 = 10% slower, 110.0 = 10% faster.
    pub fn from_percent(percent: f32, min_percent: f32, max_percent: f32) -> Self {
        let pct = percent.clamp(min_percent, max_percent);
        let q16 = (pct * (65536.0 / 100.0) + 0.5) as u32;
        RateScale(q16.max(1))
    }

    /// Raw Q16 value (65536 = 100%).
    pub fn q16(&self) -> u32 {
        self.0
    }

    pub fn from_q16(q16: u32) -> Self {
        RateScale(q16.max(1))
    }

    pub fn is_unity(&self) -> bool {
        self.0 == 1 << 16
    }

    /// Apply the multiplier to a sample rate, rounding to the nearest Hz.
    pub fn apply(&self, rate_hz: u32) -> u32 {
        let scaled = (u64::from(rate_hz) * u64::from(self.0) + 32768) >> 16;
        scaled as u32
    }
}

impl Default for RateScale {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Map a signed 16-bit PCM sample to a PWM duty level in `0..=wrap`.
///
/// Fixed-point affine transform: shift the signed range to unsigned, then
/// scale by `wrap + 1` with a multiply-and-shift. No floating point — this
/// runs in the interrupt-context fill path.
///
/// The mapping is monotonic, and the extremes are exact:
/// `i16::MIN` maps to 0 and `i16::MAX` maps to `wrap`.
#[inline]
pub fn pcm16_to_level(sample: i16, wrap: u16) -> u16 {
    let unsigned = (i32::from(sample) + 32768) as u32; // 0..=65535
    ((unsigned * (u32::from(wrap) + 1)) >> 16) as u16
}

/// Duty level representing silence (the midpoint of the PWM range).
#[inline]
pub fn silence_level(wrap: u16) -> u16 {
    wrap / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_scale_unity() {
        let scale = RateScale::default();
        assert!(scale.is_unity());
        assert_eq!(scale.apply(44100), 44100);
    }

    #[test]
    fn test_rate_scale_from_percent() {
        let scale = RateScale::from_percent(200.0, 50.0, 200.0);
        assert_eq!(scale.apply(44100), 88200);

        let scale = RateScale::from_percent(50.0, 50.0, 200.0);
        assert_eq!(scale.apply(44100), 22050);
    }

    #[test]
    fn test_rate_scale_clamps_percent() {
        let hi = RateScale::from_percent(500.0, 50.0, 200.0);
        assert_eq!(hi.apply(44100), 88200);

        let lo = RateScale::from_percent(1.0, 50.0, 200.0);
        assert_eq!(lo.apply(44100), 22050);
    }

    #[test]
    fn test_rate_scale_rounds() {
        // 90% of 44100 = 39690 exactly
        let scale = RateScale::from_percent(90.0, 50.0, 200.0);
        let scaled = scale.apply(44100);
        assert!((39689..=39691).contains(&scaled));
    }

    #[test]
    fn test_level_mapping_extremes() {
        for wrap in [255u16, 1023, 4095, u16::MAX - 1] {
            assert_eq!(pcm16_to_level(i16::MIN, wrap), 0, "wrap={}", wrap);
            assert_eq!(pcm16_to_level(i16::MAX, wrap), wrap, "wrap={}", wrap);
        }
    }

    #[test]
    fn test_level_mapping_monotonic() {
        for wrap in [255u16, 1023, 4095] {
            let mut prev = pcm16_to_level(i16::MIN, wrap);
            let mut sample = i32::from(i16::MIN);
            while sample < i32::from(i16::MAX) {
                sample += 257; // stride keeps the test fast but covers the range
                let level = pcm16_to_level(sample.min(i32::from(i16::MAX)) as i16, wrap);
                assert!(level >= prev, "non-monotonic at sample={} wrap={}", sample, wrap);
                assert!(level <= wrap);
                prev = level;
            }
        }
    }

    #[test]
    fn test_level_mapping_zero_near_midpoint() {
        let wrap = 1023;
        let level = pcm16_to_level(0, wrap);
        let mid = silence_level(wrap);
        assert!((i32::from(level) - i32::from(mid)).abs() <= 1);
    }
}
