//! Diagnostic test tone generator
//!
//! Phase-accumulator oscillator producing a softened sawtooth. The raw saw
//! has harsh high harmonics on a PWM output stage, so each sample is bent
//! with a quadratic term that rounds the ramp without costing a multiply
//! table or floats.

use tracing::debug;

/// Lowest selectable tone frequency in Hz.
pub const TONE_FREQ_MIN: u32 = 20;

/// Highest selectable tone frequency in Hz.
pub const TONE_FREQ_MAX: u32 = 12_000;

/// Fixed-point sawtooth oscillator with quadratic softening.
///
/// The 32-bit phase accumulator advances by `(freq << 32) / sample_rate` per
/// sample, so frequency accuracy is limited only by the accumulator width and
/// phase wraps for free on overflow.
pub struct ToneGenerator {
    phase: u32,
    step: u32,
}

impl ToneGenerator {
    /// Create a generator for `freq_hz` at the given output sample rate.
    ///
    /// The frequency is clamped to the audible/useful band
    /// [`TONE_FREQ_MIN`]..=[`TONE_FREQ_MAX`].
    pub fn new(freq_hz: u32, sample_rate: u32) -> Self {
        let freq = freq_hz.clamp(TONE_FREQ_MIN, TONE_FREQ_MAX);
        if freq != freq_hz {
            debug!("Clamped tone frequency {} Hz to {} Hz", freq_hz, freq);
        }

        let rate = sample_rate.max(1);
        let step = ((u64::from(freq) << 32) / u64::from(rate)) as u32;
        Self { phase: 0, step }
    }

    /// Next mono sample.
    pub fn next_sample(&mut self) -> i16 {
        // Top 16 bits of phase as a signed ramp -32768..=32767
        let saw = (self.phase >> 16) as i32 - 32768;
        // Quadratic bend toward a softer waveform
        let shaped = saw - (saw * saw / 32768) / 4;
        self.phase = self.phase.wrapping_add(self.step);
        shaped as i16
    }

    /// Fill `dst` with interleaved frames (the same sample on each channel).
    pub fn fill(&mut self, dst: &mut [i16], frames: usize, channels: usize) -> usize {
        let frames = frames.min(dst.len() / channels.max(1));
        for i in 0..frames {
            let s = self.next_sample();
            for c in 0..channels {
                dst[i * channels + c] = s;
            }
        }
        frames
    }
}
