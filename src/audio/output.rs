//! DMA-driven PWM audio output engine
//!
//! Owns the ping-pong sample buffers and the streaming loop: one buffer is
//! being played by DMA while the provider callback fills the other, with
//! roles swapping on each hardware completion. Signed 16-bit PCM is converted
//! to duty levels with a fixed-point transform; a slow provider causes
//! repeated-sample padding and an underrun count, never a halt.
//!
//! ```text
//!  provider ──> fill_slot ──> slots[fill] ─┐
//!                                          │ on_batch_complete (IRQ)
//!  hardware <── arm_transfer <── slots[play] <┘
//! ```
//!
//! Completion handling prioritizes hardware continuity: re-arm the already
//! filled buffer first, flip the playing index, and only then refill the
//! buffer that just finished.

use crate::audio::hal::PwmBackend;
use crate::audio::rate::{self, PwmTiming};
use crate::audio::types::{pcm16_to_level, silence_level, OutputPins};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Pull callback filling up to `max_frames` of interleaved PCM into `dst`.
///
/// Returns the number of frames actually provided (may be fewer on
/// underrun). Runs in interrupt context after the initial prefill, so it
/// must not block or allocate.
pub type SampleProvider = Box<dyn FnMut(&mut [i16], usize) -> usize + Send>;

/// Output engine configuration for one playback session.
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    pub pins: OutputPins,

    /// Target sample rate; the rate fitter picks the closest achievable one
    pub sample_rate: u32,

    /// 1 (mono duplicated to both pins) or 2 (interleaved stereo)
    pub channels: u16,

    /// System clock feeding the PWM slice
    pub clock_hz: u32,

    /// Frames per DMA batch (per ping-pong slot)
    pub batch_frames: usize,
}

/// One ping-pong slot: per-channel duty levels for a single DMA batch.
struct LevelSlot {
    left: Box<[u16]>,
    right: Box<[u16]>,
}

/// Double-buffered PWM output engine.
///
/// ## Ownership discipline
///
/// Exactly one slot index is "playing" (owned by hardware) and the other is
/// "filling" (owned by software). The per-slot mutexes are never contended in
/// steady state: the completion path is the only caller that touches slots
/// after `start()`, and it locks the filled slot only to arm it and the
/// finished slot only to refill it. The locks exist so the prefill path and
/// a hypothetical misbehaving backend fail safe instead of racing.
pub struct AudioOutputEngine {
    backend: Arc<dyn PwmBackend>,

    slots: [Mutex<LevelSlot>; 2],

    /// Index currently owned by DMA
    play_idx: AtomicUsize,

    provider: Mutex<Option<SampleProvider>>,

    /// Interleaved PCM staging buffer for provider pulls
    scratch: Mutex<Vec<i16>>,

    timing: PwmTiming,
    pins: OutputPins,
    channels: u16,
    batch_frames: usize,

    started: AtomicBool,

    /// Hardware channels were released by a previous `stop()`
    released: AtomicBool,

    /// Batches that the provider under-filled
    underruns: AtomicU64,

    /// Last valid PCM sample per channel, for cross-batch padding.
    /// Stored as `i16` bits widened to u32 (stale values are acceptable).
    last_left: AtomicU32,
    last_right: AtomicU32,
}

impl AudioOutputEngine {
    /// Configure pins and timing for a session; output stays disabled.
    ///
    /// Runs the rate fitter, programs wrap/divider through the backend, and
    /// parks both ping-pong slots and the output at the silence level.
    pub fn new(backend: Arc<dyn PwmBackend>, cfg: OutputConfig) -> Result<Self> {
        let channels = cfg.channels.clamp(1, 2);
        if channels != cfg.channels {
            warn!("clamped channel count {} to {}", cfg.channels, channels);
        }
        if cfg.batch_frames == 0 {
            return Err(Error::Config("batch_frames must be nonzero".into()));
        }

        let timing = rate::fit(cfg.sample_rate, cfg.clock_hz)?;
        backend.configure(cfg.pins, &timing)?;

        let silence = silence_level(timing.wrap);
        backend.set_idle_levels(silence);

        let make_slot = || LevelSlot {
            left: vec![silence; cfg.batch_frames].into_boxed_slice(),
            right: vec![silence; cfg.batch_frames].into_boxed_slice(),
        };

        debug!(
            "Audio output configured: pins=({},{}) target={}Hz achieved={:.3}Hz wrap={} batch={} frames",
            cfg.pins.left, cfg.pins.right, cfg.sample_rate, timing.achieved_hz, timing.wrap, cfg.batch_frames
        );

        Ok(Self {
            backend,
            slots: [Mutex::new(make_slot()), Mutex::new(make_slot())],
            play_idx: AtomicUsize::new(0),
            provider: Mutex::new(None),
            scratch: Mutex::new(vec![0i16; cfg.batch_frames * channels as usize]),
            timing,
            pins: cfg.pins,
            channels,
            batch_frames: cfg.batch_frames,
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            last_left: AtomicU32::new(0),
            last_right: AtomicU32::new(0),
        })
    }

    /// Register the pull provider. Only valid before `start()`.
    pub fn set_provider(&self, provider: SampleProvider) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "cannot change provider while output is running".into(),
            ));
        }
        *self.provider.lock().unwrap() = Some(provider);
        Ok(())
    }

    /// Pre-fill both slots, arm the first DMA batch, and enable the output.
    ///
    /// Filling both slots before the hardware is enabled closes the startup
    /// race where DMA could read a buffer the provider has not written yet.
    pub fn start(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState("output already started".into()));
        }
        if self.provider.lock().unwrap().is_none() {
            return Err(Error::InvalidState("no provider registered".into()));
        }

        // Restarting after stop(): the channels were released
        if self.released.swap(false, Ordering::AcqRel) {
            self.backend.configure(self.pins, &self.timing)?;
            self.backend.set_idle_levels(silence_level(self.timing.wrap));
        }

        self.fill_slot(0);
        self.fill_slot(1);

        {
            let slot = self.slots[0].lock().unwrap();
            self.backend.arm_transfer(&slot.left, &slot.right)?;
        }
        self.play_idx.store(0, Ordering::Release);
        self.backend.set_enabled(true);
        self.started.store(true, Ordering::Release);

        debug!("Audio output started");
        Ok(())
    }

    /// Abort in-flight transfers, silence and disable the output, and
    /// release claimed hardware channels. Safe to call in any state.
    pub fn stop(&self) {
        let was_running = self.started.swap(false, Ordering::AcqRel);

        self.backend.abort_transfers();
        self.backend.set_enabled(false);
        self.backend.set_idle_levels(silence_level(self.timing.wrap));
        self.backend.release();
        self.released.store(true, Ordering::Release);

        if was_running {
            debug!(
                "Audio output stopped (underruns: {})",
                self.underruns.load(Ordering::Relaxed)
            );
        }
    }

    /// Transfer-complete entry point, called from interrupt context.
    ///
    /// Re-arms the already-filled opposite slot first to minimize the output
    /// gap, flips the playing index, then synchronously refills the slot
    /// that just finished.
    pub fn on_batch_complete(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        let finished = self.play_idx.load(Ordering::Acquire);
        let next = finished ^ 1;

        {
            let slot = self.slots[next].lock().unwrap();
            if let Err(e) = self.backend.arm_transfer(&slot.left, &slot.right) {
                warn!("failed to re-arm DMA batch: {}", e);
            }
        }
        self.play_idx.store(next, Ordering::Release);

        self.fill_slot(finished);
    }

    /// Batches the provider under-filled since engine creation.
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Sample rate actually produced by the fitted timing, rounded to Hz.
    pub fn achieved_sample_rate(&self) -> u32 {
        self.timing.achieved_hz_rounded()
    }

    /// Fitted hardware timing for this session.
    pub fn timing(&self) -> &PwmTiming {
        &self.timing
    }

    pub fn batch_frames(&self) -> usize {
        self.batch_frames
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Pull one batch from the provider into the given slot.
    ///
    /// A short batch is padded by repeating the last valid sample — not
    /// silence, which would step the output level and click.
    fn fill_slot(&self, idx: usize) {
        let frames = self.batch_frames;
        let ch = self.channels as usize;

        let mut scratch = self.scratch.lock().unwrap();
        let provided = {
            let mut provider = self.provider.lock().unwrap();
            match provider.as_mut() {
                Some(f) => f(&mut scratch[..frames * ch], frames).min(frames),
                // Torn down mid-stop: behave as "zero frames available"
                None => 0,
            }
        };

        if provided < frames {
            let count = self.underruns.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 0 {
                warn!("audio output underrun (total: {})", count);
            } else {
                trace!("short batch: {}/{} frames (underrun {})", provided, frames, count);
            }

            let (pad_l, pad_r) = if provided > 0 {
                let base = (provided - 1) * ch;
                (scratch[base], scratch[base + ch - 1])
            } else {
                (
                    self.last_left.load(Ordering::Relaxed) as u16 as i16,
                    self.last_right.load(Ordering::Relaxed) as u16 as i16,
                )
            };
            for i in provided..frames {
                let base = i * ch;
                scratch[base] = pad_l;
                scratch[base + ch - 1] = pad_r;
            }
        }

        let base = (frames - 1) * ch;
        self.last_left
            .store(scratch[base] as u16 as u32, Ordering::Relaxed);
        self.last_right
            .store(scratch[base + ch - 1] as u16 as u32, Ordering::Relaxed);

        let wrap = self.timing.wrap;
        let mut slot = self.slots[idx].lock().unwrap();
        for i in 0..frames {
            let l = scratch[i * ch];
            let r = scratch[i * ch + ch - 1]; // mono duplicates to both pins
            slot.left[i] = pcm16_to_level(l, wrap);
            slot.right[i] = pcm16_to_level(r, wrap);
        }
    }
}

impl Drop for AudioOutputEngine {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) {
            self.stop();
        }
    }
}
