//! PWM timing fit for a target sample rate
//!
//! The PWM slice produces one sample per counter wrap, so the output sample
//! rate is `clock_hz / (divider * (wrap + 1))`. Both parameters are discrete:
//! the wrap is an integer period and the clock divider has only 4 fractional
//! bits (granularity 1/16, integer part 1..=255). A naive fixed wrap gives an
//! audible pitch error at rates that don't divide the system clock evenly, so
//! this module searches the (wrap, divider) grid for the pair minimizing the
//! absolute frequency error.

use crate::error::{Error, Result};
use tracing::debug;

/// Fractional bits in the hardware clock divider.
pub const DIV_FRAC_BITS: u32 = 4;

/// Smallest representable divider, in 1/16 steps (1.0).
const DIV16_MIN: u64 = 1 << DIV_FRAC_BITS;

/// Largest representable divider, in 1/16 steps (255 + 15/16).
const DIV16_MAX: u64 = (255 << DIV_FRAC_BITS) | 0xF;

/// Wrap candidates are searched over a bounded practical range: long enough
/// for usable duty resolution, short enough that the divider stays in range
/// at audio rates.
const WRAP_MIN: u32 = 200;
const WRAP_MAX: u32 = 4096;

/// Early-out once the relative frequency error drops below this.
const FIT_EPSILON: f64 = 1e-6;

/// Hardware timing parameters chosen for one output session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmTiming {
    /// Counter wrap value ("TOP"); the period is `wrap + 1` counts
    pub wrap: u16,

    /// Integer part of the clock divider (1..=255)
    pub div_int: u8,

    /// Fractional part of the clock divider, in 1/16 steps (0..=15)
    pub div_frac: u8,

    /// Sample rate actually produced by (wrap, divider) at the given clock
    pub achieved_hz: f64,
}

impl PwmTiming {
    /// Divider in 1/16 steps, as programmed into the hardware register.
    pub fn div16(&self) -> u32 {
        (u32::from(self.div_int) << DIV_FRAC_BITS) | u32::from(self.div_frac)
    }

    /// Achieved rate rounded to the nearest Hz, for diagnostics.
    pub fn achieved_hz_rounded(&self) -> u32 {
        self.achieved_hz.round() as u32
    }
}

/// Pick the (wrap, divider) pair that best approximates `target_hz`.
///
/// For each candidate wrap the ideal divider is
/// `clock_hz / (target_hz * (wrap + 1))`, rounded to the nearest 1/16 step
/// (rounding carries into the integer part naturally since the search works
/// in 1/16 units). Candidates whose divider falls outside the representable
/// range are rejected.
///
/// # Errors
/// `Error::Config` if `target_hz` is zero or no (wrap, divider) pair in range
/// can reach it.
pub fn fit(target_hz: u32, clock_hz: u32) -> Result<PwmTiming> {
    if target_hz == 0 || clock_hz == 0 {
        return Err(Error::Config(format!(
            "cannot fit PWM timing for target {} Hz at clock {} Hz",
            target_hz, clock_hz
        )));
    }

    let clock16 = u64::from(clock_hz) << DIV_FRAC_BITS;
    let mut best: Option<PwmTiming> = None;
    let mut best_err = f64::INFINITY;

    for wrap in WRAP_MIN..=WRAP_MAX {
        let period = u64::from(wrap) + 1;
        let denom = u64::from(target_hz) * period;

        // Ideal divider in 1/16 steps, rounded to nearest.
        let div16 = (clock16 + denom / 2) / denom;
        if !(DIV16_MIN..=DIV16_MAX).contains(&div16) {
            continue;
        }

        let achieved = clock16 as f64 / (div16 * period) as f64;
        let err = (achieved - f64::from(target_hz)).abs();
        if err < best_err {
            best_err = err;
            best = Some(PwmTiming {
                wrap: wrap as u16,
                div_int: (div16 >> DIV_FRAC_BITS) as u8,
                div_frac: (div16 & 0xF) as u8,
                achieved_hz: achieved,
            });

            if err <= f64::from(target_hz) * FIT_EPSILON {
                break;
            }
        }
    }

    match best {
        Some(timing) => {
            debug!(
                "PWM fit: target={}Hz clock={}Hz -> wrap={} div={}+{}/16 achieved={:.3}Hz",
                target_hz, clock_hz, timing.wrap, timing.div_int, timing.div_frac, timing.achieved_hz
            );
            Ok(timing)
        }
        None => Err(Error::Config(format!(
            "no PWM timing within divider range reaches {} Hz at clock {} Hz",
            target_hz, clock_hz
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 125_000_000;

    #[test]
    fn test_fit_common_rates_within_bound() {
        for target in [8_000u32, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000] {
            let timing = fit(target, CLOCK).unwrap();
            let rel_err = (timing.achieved_hz - f64::from(target)).abs() / f64::from(target);
            assert!(
                rel_err < 0.001,
                "target={} achieved={:.3} rel_err={}",
                target,
                timing.achieved_hz,
                rel_err
            );
        }
    }

    #[test]
    fn test_fit_sweep_divider_in_range() {
        let mut target = 8_000u32;
        while target <= 48_000 {
            let timing = fit(target, CLOCK).unwrap();
            assert!((1..=255).contains(&timing.div_int), "target={}", target);
            assert!(timing.div_frac <= 15, "target={}", target);
            assert!((200..=4096).contains(&u32::from(timing.wrap)), "target={}", target);
            target += 977; // prime stride to avoid hitting only friendly rates
        }
    }

    #[test]
    fn test_fit_exact_divisor() {
        // 125 MHz / (500 * 250) = 1000 Hz... pick a rate the clock divides
        // exactly: wrap+1=1000, div=1 -> 125 kHz is out of audio range, so use
        // 25 kHz: 125e6 / (2500*2) with wrap+1=2500, div=2.
        let timing = fit(25_000, CLOCK).unwrap();
        assert!((timing.achieved_hz - 25_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_scaled_rate() {
        // 200% of 44100
        let timing = fit(88_200, CLOCK).unwrap();
        let rel_err = (timing.achieved_hz - 88_200.0).abs() / 88_200.0;
        assert!(rel_err < 0.001);
    }

    #[test]
    fn test_fit_rejects_zero() {
        assert!(fit(0, CLOCK).is_err());
        assert!(fit(44_100, 0).is_err());
    }

    #[test]
    fn test_fit_unreachable_rate() {
        // Faster than clock / (wrap_min + 1): no divider >= 1.0 can reach it.
        assert!(fit(CLOCK, CLOCK).is_err());
    }

    #[test]
    fn test_div16_roundtrip() {
        let timing = fit(44_100, CLOCK).unwrap();
        let div16 = timing.div16();
        assert_eq!(div16 >> DIV_FRAC_BITS, u32::from(timing.div_int));
        assert_eq!(div16 & 0xF, u32::from(timing.div_frac));
    }
}
