//! Playback state machine
//!
//! Bridges the pull decoder (variable-cost, may yield nothing) to the ring
//! buffer (fixed-size, byte-oriented) to the output engine (pull,
//! fixed-rate). One [`Player`] owns one playback session at a time:
//! `load()` opens the stream and sizes the ring, `play()` predecodes a
//! startup cushion and starts the output, a periodic timer tops the ring up
//! through a single-slot service queue, and `stop()` tears everything down
//! from any state.
//!
//! Decode work never runs in the timer context. The timer only checks
//! occupancy and, guarded by a pending flag, nudges the service task that
//! runs the actual refill pass. The provider callback runs in the output
//! completion context and takes no locks it could block on.

use crate::audio::decoder::{DecodeDiagnostics, DecodeOutcome, Decoder, SymphoniaDecoder};
use crate::audio::hal::PwmBackend;
use crate::audio::output::{AudioOutputEngine, OutputConfig, SampleProvider};
use crate::audio::types::{OutputPins, RateScale, StreamInfo};
use crate::error::{Error, Result};
use crate::params::PARAMS;
use crate::playback::ring_buffer::PcmRingBuffer;
use crate::playback::state::PlayerState;
use crate::playback::tone::ToneGenerator;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Sample rate used for the standalone test tone session.
const TONE_SAMPLE_RATE: u32 = 44_100;

/// Player construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    pub pins: OutputPins,

    /// Ring buffer latency window; `None` uses the configured default
    pub buffer_ms: Option<u32>,
}

/// Snapshot of observable playback state, shaped for the host surface.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStats {
    /// Nominal stream sample rate (before rate scaling), 0 when idle
    pub sample_rate: u32,
    pub channels: u16,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub target_bytes: usize,
    pub eof: bool,
    pub state: PlayerState,
    pub underruns: u64,
}

/// State shared between the player, the timer/service tasks, and the
/// provider callback. Everything the interrupt-side provider touches is
/// atomic or try-locked.
struct SessionShared {
    state: RwLock<PlayerState>,

    /// Present from `load()` until `stop()`
    ring: RwLock<Option<Arc<PcmRingBuffer>>>,

    info: RwLock<Option<StreamInfo>>,

    /// Bytes per frame (channels x 2)
    frame_bytes: AtomicUsize,

    /// High-water mark in bytes
    target_bytes: AtomicUsize,

    /// Achieved output rate of the running session, 0 when none
    out_rate: AtomicU32,

    /// Decoder exhausted or fatal decode error
    eof: AtomicBool,

    /// Provider synthesizes a tone instead of draining the ring
    tone_mode: AtomicBool,
    tone: Mutex<Option<ToneGenerator>>,

    /// Re-entrancy guard: at most one refill pass queued at a time
    service_pending: AtomicBool,

    /// Cleared by teardown; timer and service tasks exit on it
    running: AtomicBool,

    /// Interleaved PCM decode staging, sized at play()
    decode_pcm: Mutex<Vec<i16>>,

    /// Byte-serialized staging for ring writes
    decode_bytes: Mutex<Vec<u8>>,

    /// Byte staging for the provider's ring reads (interrupt side)
    provider_bytes: Mutex<Vec<u8>>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: RwLock::new(PlayerState::Idle),
            ring: RwLock::new(None),
            info: RwLock::new(None),
            frame_bytes: AtomicUsize::new(0),
            target_bytes: AtomicUsize::new(0),
            out_rate: AtomicU32::new(0),
            eof: AtomicBool::new(false),
            tone_mode: AtomicBool::new(false),
            tone: Mutex::new(None),
            service_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            decode_pcm: Mutex::new(Vec::new()),
            decode_bytes: Mutex::new(Vec::new()),
            provider_bytes: Mutex::new(Vec::new()),
        }
    }
}

/// PWM audio player: one playback session at a time.
///
/// The decoder object is retained across stop/play cycles; only its
/// session-specific stream is opened and closed.
pub struct Player {
    backend: Arc<dyn PwmBackend>,
    cfg: PlayerConfig,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    shared: Arc<SessionShared>,
    engine: Mutex<Option<Arc<AudioOutputEngine>>>,

    /// Rate multiplier (Q16) applied at the next play()
    rate_scale: AtomicU32,

    timer_task: Mutex<Option<JoinHandle<()>>>,
    service_task: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Create a player decoding through symphonia.
    pub fn new(backend: Arc<dyn PwmBackend>, cfg: PlayerConfig) -> Self {
        Self::with_decoder(backend, cfg, Box::new(SymphoniaDecoder::new()))
    }

    /// Create a player with a caller-supplied decoder implementation.
    pub fn with_decoder(
        backend: Arc<dyn PwmBackend>,
        cfg: PlayerConfig,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        Self {
            backend,
            cfg,
            decoder: Arc::new(Mutex::new(decoder)),
            shared: Arc::new(SessionShared::new()),
            engine: Mutex::new(None),
            rate_scale: AtomicU32::new(RateScale::UNITY.q16()),
            timer_task: Mutex::new(None),
            service_task: Mutex::new(None),
        }
    }

    /// Open a stream and size the ring buffer for it.
    ///
    /// Valid from `Idle` and `Eof`. The ring is sized for the configured
    /// latency window at the stream's byte rate, and the high-water target
    /// is a fraction of capacity so a decode burst landing while the
    /// provider drains cannot overflow.
    pub fn load(&self, path: &Path) -> Result<()> {
        match self.state() {
            PlayerState::Idle => {}
            PlayerState::Eof => self.teardown_session(),
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot load while {}",
                    other
                )))
            }
        }

        let opened = self.decoder.lock().unwrap().open(path)?;
        // The ring framing, provider, and output engine all derive their
        // layout from this count; clamp once here so they agree.
        let channels = opened.channels.clamp(1, 2);
        if channels != opened.channels {
            warn!(
                "Clamped stream channel count {} to {}",
                opened.channels, channels
            );
        }
        let info = StreamInfo {
            sample_rate: opened.sample_rate,
            channels,
        };
        let frame_bytes = usize::from(info.channels) * 2;

        let buffer_ms = self
            .cfg
            .buffer_ms
            .unwrap_or_else(|| *PARAMS.default_buffer_ms.read().unwrap());
        let bytes_per_sec = info.sample_rate as usize * frame_bytes;
        let capacity = (bytes_per_sec * buffer_ms as usize / 1000).max(frame_bytes * 2);
        let ring = Arc::new(PcmRingBuffer::new(capacity)?);

        let fraction = *PARAMS.high_water_fraction.read().unwrap();
        let mut target = (capacity as f32 * fraction) as usize;
        target -= target % frame_bytes;

        debug!(
            "Loaded {}: {}Hz {}ch, ring {} bytes, target {} bytes",
            path.display(),
            info.sample_rate,
            info.channels,
            capacity,
            target
        );

        *self.shared.ring.write().unwrap() = Some(ring);
        *self.shared.info.write().unwrap() = Some(info);
        self.shared.frame_bytes.store(frame_bytes, Ordering::Release);
        self.shared.target_bytes.store(target, Ordering::Release);
        self.shared.eof.store(false, Ordering::Release);
        self.shared.tone_mode.store(false, Ordering::Release);
        *self.shared.state.write().unwrap() = PlayerState::Loaded;
        Ok(())
    }

    /// Start playback of the loaded stream.
    ///
    /// Valid from `Loaded` and `Eof` (the latter rewinds the stream).
    /// Predecodes up to half the high-water mark synchronously — bounded by
    /// a zero-yield scan limit and a wall-clock patience timeout so startup
    /// latency stays bounded even on malformed input — then starts the
    /// output and arms the refill timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn play(&self) -> Result<()> {
        match self.state() {
            PlayerState::Loaded => {}
            PlayerState::Eof => {
                self.teardown_session();
                *self.shared.state.write().unwrap() = PlayerState::Loaded;
                self.decoder.lock().unwrap().rewind()?;
                self.shared.eof.store(false, Ordering::Release);
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot play while {}",
                    other
                )))
            }
        }

        let info = (*self.shared.info.read().unwrap())
            .ok_or_else(|| Error::InvalidState("no stream loaded".to_string()))?;
        let frame_bytes = usize::from(info.channels) * 2;

        let scale = RateScale::from_q16(self.rate_scale.load(Ordering::Acquire));
        let target_hz = self.clamp_rate(scale.apply(info.sample_rate));

        let batch_frames = *PARAMS.batch_frames.read().unwrap();
        let engine = Arc::new(AudioOutputEngine::new(
            Arc::clone(&self.backend),
            OutputConfig {
                pins: self.cfg.pins,
                sample_rate: target_hz,
                channels: info.channels,
                clock_hz: *PARAMS.pwm_clock_hz.read().unwrap(),
                batch_frames,
            },
        )?);

        let ring = self.ring()?;
        ring.clear();
        self.shared.eof.store(false, Ordering::Release);
        self.shared.tone_mode.store(false, Ordering::Release);

        self.alloc_scratch(frame_bytes, batch_frames)?;
        self.predecode(&ring, frame_bytes);

        engine.set_provider(Self::make_provider(
            Arc::clone(&self.shared),
            usize::from(info.channels),
        ))?;
        engine.start()?;

        self.shared
            .out_rate
            .store(engine.achieved_sample_rate(), Ordering::Release);
        *self.engine.lock().unwrap() = Some(engine);

        self.spawn_refill_tasks();
        *self.shared.state.write().unwrap() = PlayerState::Playing;
        debug!(
            "Playing at {}Hz (scale {}%)",
            target_hz,
            scale.q16() as f64 * 100.0 / 65536.0
        );
        Ok(())
    }

    /// Halt playback and return to `Idle`. Safe to call in any state.
    pub fn stop(&self) {
        self.teardown_session();
        self.decoder.lock().unwrap().close();

        *self.shared.ring.write().unwrap() = None;
        *self.shared.info.write().unwrap() = None;
        self.shared.frame_bytes.store(0, Ordering::Release);
        self.shared.target_bytes.store(0, Ordering::Release);
        self.shared.out_rate.store(0, Ordering::Release);
        self.shared.eof.store(false, Ordering::Release);
        self.shared.tone_mode.store(false, Ordering::Release);
        *self.shared.tone.lock().unwrap() = None;
        *self.shared.state.write().unwrap() = PlayerState::Idle;
        debug!("Playback stopped");
    }

    /// Current lifecycle state.
    ///
    /// `Eof` is derived, not stored: a `Playing` session whose decoder is
    /// exhausted reports `Eof` once the ring has drained below one frame.
    pub fn state(&self) -> PlayerState {
        let stored = *self.shared.state.read().unwrap();
        if stored == PlayerState::Playing
            && self.shared.eof.load(Ordering::Acquire)
            && !self.shared.tone_mode.load(Ordering::Acquire)
        {
            let frame_bytes = self.shared.frame_bytes.load(Ordering::Acquire).max(1);
            let drained = self
                .shared
                .ring
                .read()
                .unwrap()
                .as_ref()
                .map(|r| r.used_space() < frame_bytes)
                .unwrap_or(true);
            if drained {
                return PlayerState::Eof;
            }
        }
        stored
    }

    /// Observable playback counters and configuration.
    pub fn stats(&self) -> PlayerStats {
        let info = *self.shared.info.read().unwrap();
        let (used, free) = self
            .shared
            .ring
            .read()
            .unwrap()
            .as_ref()
            .map(|r| (r.used_space(), r.free_space()))
            .unwrap_or((0, 0));
        let underruns = self
            .engine
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.underrun_count())
            .unwrap_or(0);

        PlayerStats {
            sample_rate: info.map(|i| i.sample_rate).unwrap_or(0),
            channels: info.map(|i| i.channels).unwrap_or(0),
            used_bytes: used,
            free_bytes: free,
            target_bytes: self.shared.target_bytes.load(Ordering::Acquire),
            eof: self.shared.eof.load(Ordering::Acquire),
            state: self.state(),
            underruns,
        }
    }

    /// Store a playback-rate multiplier for the next `play()`.
    ///
    /// 100.0 = nominal. Clamped to the configured safe range; a running
    /// session is unaffected.
    pub fn set_rate(&self, percent: f32) {
        let min = *PARAMS.rate_scale_min_percent.read().unwrap();
        let max = *PARAMS.rate_scale_max_percent.read().unwrap();
        let scale = RateScale::from_percent(percent, min, max);
        self.rate_scale.store(scale.q16(), Ordering::Release);
        debug!("Rate scale set to Q16 {} ({}%)", scale.q16(), percent);
    }

    /// Sample rate actually produced by the running output, 0 when idle.
    pub fn out_rate(&self) -> u32 {
        self.shared.out_rate.load(Ordering::Acquire)
    }

    /// Decode counters for the current stream (reset on each open).
    pub fn diag(&self) -> DecodeDiagnostics {
        self.decoder.lock().unwrap().diagnostics()
    }

    /// Output engine of the running session, for completion wiring.
    ///
    /// The hardware glue (or a test standing in for the DMA interrupt)
    /// calls `on_batch_complete()` on this handle.
    pub fn output(&self) -> Option<Arc<AudioOutputEngine>> {
        self.engine.lock().unwrap().clone()
    }

    /// Play a diagnostic tone at `freq_hz`.
    ///
    /// While `Playing`, switches the provider to tone synthesis in place;
    /// ring refill pauses and the buffered stream data is held untouched.
    /// From any other state, starts a standalone stereo tone session at
    /// 44.1 kHz with the current rate scale applied. `stop()` ends either
    /// form.
    pub fn test_tone(&self, freq_hz: u32) -> Result<()> {
        if *self.shared.state.read().unwrap() == PlayerState::Playing {
            let rate = self.shared.out_rate.load(Ordering::Acquire).max(1);
            *self.shared.tone.lock().unwrap() = Some(ToneGenerator::new(freq_hz, rate));
            self.shared.tone_mode.store(true, Ordering::Release);
            debug!("Switched running session to {} Hz test tone", freq_hz);
            return Ok(());
        }

        self.teardown_session();

        let scale = RateScale::from_q16(self.rate_scale.load(Ordering::Acquire));
        let target_hz = self.clamp_rate(scale.apply(TONE_SAMPLE_RATE));
        let batch_frames = *PARAMS.batch_frames.read().unwrap();

        let engine = Arc::new(AudioOutputEngine::new(
            Arc::clone(&self.backend),
            OutputConfig {
                pins: self.cfg.pins,
                sample_rate: target_hz,
                channels: 2,
                clock_hz: *PARAMS.pwm_clock_hz.read().unwrap(),
                batch_frames,
            },
        )?);

        *self.shared.tone.lock().unwrap() = Some(ToneGenerator::new(
            freq_hz,
            engine.achieved_sample_rate(),
        ));
        self.shared.tone_mode.store(true, Ordering::Release);

        engine.set_provider(Self::make_provider(Arc::clone(&self.shared), 2))?;
        engine.start()?;

        self.shared
            .out_rate
            .store(engine.achieved_sample_rate(), Ordering::Release);
        *self.engine.lock().unwrap() = Some(engine);
        *self.shared.state.write().unwrap() = PlayerState::Playing;
        debug!("Test tone started: {} Hz", freq_hz);
        Ok(())
    }

    fn ring(&self) -> Result<Arc<PcmRingBuffer>> {
        self.shared
            .ring
            .read()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::InvalidState("no stream loaded".to_string()))
    }

    fn clamp_rate(&self, hz: u32) -> u32 {
        let min = *PARAMS.sample_rate_min_hz.read().unwrap();
        let max = *PARAMS.sample_rate_max_hz.read().unwrap();
        hz.clamp(min, max)
    }

    /// Size the decode and provider staging buffers for this session.
    fn alloc_scratch(&self, frame_bytes: usize, batch_frames: usize) -> Result<()> {
        let scratch_frames = *PARAMS.scratch_frames.read().unwrap();
        let samples = scratch_frames * frame_bytes / 2;

        let mut pcm = self.shared.decode_pcm.lock().unwrap();
        pcm.clear();
        pcm.try_reserve_exact(samples)
            .map_err(|_| Error::Allocation(format!("decode scratch of {} samples", samples)))?;
        pcm.resize(samples, 0);

        let mut bytes = self.shared.decode_bytes.lock().unwrap();
        bytes.clear();
        bytes
            .try_reserve_exact(samples * 2)
            .map_err(|_| Error::Allocation(format!("byte scratch of {} bytes", samples * 2)))?;
        bytes.resize(samples * 2, 0);

        let provider_len = batch_frames * frame_bytes;
        let mut pbytes = self.shared.provider_bytes.lock().unwrap();
        pbytes.clear();
        pbytes
            .try_reserve_exact(provider_len)
            .map_err(|_| Error::Allocation(format!("provider scratch of {} bytes", provider_len)))?;
        pbytes.resize(provider_len, 0);
        Ok(())
    }

    /// Synchronous startup fill: half the high-water mark, then a cushion.
    fn predecode(&self, ring: &PcmRingBuffer, frame_bytes: usize) {
        let goal = self.shared.target_bytes.load(Ordering::Acquire) / 2;
        let zero_limit = *PARAMS.zero_scan_limit.read().unwrap();
        let patience = Duration::from_millis(*PARAMS.predecode_patience_ms.read().unwrap());
        let started = Instant::now();

        let mut decoder = self.decoder.lock().unwrap();
        let mut pcm = self.shared.decode_pcm.lock().unwrap();
        let mut bytes = self.shared.decode_bytes.lock().unwrap();
        let scratch_frames = pcm.len() / (frame_bytes / 2);

        let mut zero_runs = 0u32;
        while ring.used_space() < goal && zero_runs < zero_limit && started.elapsed() < patience {
            if !Self::decode_step(
                decoder.as_mut(),
                &self.shared,
                ring,
                &mut pcm,
                &mut bytes,
                scratch_frames,
                frame_bytes,
                &mut zero_runs,
            ) {
                break;
            }
        }

        // Decoders that sync instantly leave patience to spare: spend a few
        // more attempts building a cushion against the first refill gap.
        let cushion = *PARAMS.low_water_frames.read().unwrap() * frame_bytes;
        let mut attempts = *PARAMS.cushion_attempts.read().unwrap();
        while attempts > 0
            && !self.shared.eof.load(Ordering::Acquire)
            && ring.used_space() < goal + cushion
            && started.elapsed() < patience
        {
            if !Self::decode_step(
                decoder.as_mut(),
                &self.shared,
                ring,
                &mut pcm,
                &mut bytes,
                scratch_frames,
                frame_bytes,
                &mut zero_runs,
            ) {
                break;
            }
            attempts -= 1;
        }

        debug!(
            "Predecode done: {} bytes in {:?} (zero-yield runs: {})",
            ring.used_space(),
            started.elapsed(),
            zero_runs
        );
    }

    /// One decode-and-append step. Returns false when the session should
    /// stop pulling (stream end, fatal error, or ring full).
    fn decode_step(
        decoder: &mut dyn Decoder,
        shared: &SessionShared,
        ring: &PcmRingBuffer,
        pcm: &mut [i16],
        bytes: &mut [u8],
        scratch_frames: usize,
        frame_bytes: usize,
        zero_runs: &mut u32,
    ) -> bool {
        let max_frames = (ring.free_space() / frame_bytes).min(scratch_frames);
        if max_frames == 0 {
            return false;
        }

        match decoder.decode(pcm, max_frames) {
            DecodeOutcome::Pcm(frames) => {
                *zero_runs = 0;
                let samples = frames * frame_bytes / 2;
                for (i, s) in pcm[..samples].iter().enumerate() {
                    let b = s.to_le_bytes();
                    bytes[2 * i] = b[0];
                    bytes[2 * i + 1] = b[1];
                }
                let n = frames * frame_bytes;
                let written = ring.write(&bytes[..n]);
                if written < n {
                    // Occupancy raced past the budget; stop pulling
                    trace!("ring accepted {}/{} bytes", written, n);
                    return false;
                }
                true
            }
            DecodeOutcome::NeedData => {
                if decoder.is_end_of_stream() {
                    debug!("Decoder reached end of stream");
                    shared.eof.store(true, Ordering::Release);
                    return false;
                }
                *zero_runs += 1;
                true
            }
            DecodeOutcome::Fatal => {
                warn!("Fatal decode error; ending stream");
                shared.eof.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Background refill: decode until the high-water mark or the attempt
    /// budget runs out. Near-underrun occupancy gets the larger budget.
    fn refill_pass(shared: &SessionShared, decoder: &Mutex<Box<dyn Decoder>>) {
        // A pass queued just before tone mode engaged must also stand down
        if shared.eof.load(Ordering::Acquire) || shared.tone_mode.load(Ordering::Acquire) {
            return;
        }
        let ring = match shared.ring.read().unwrap().as_ref() {
            Some(r) => Arc::clone(r),
            None => return,
        };
        let frame_bytes = shared.frame_bytes.load(Ordering::Acquire);
        if frame_bytes == 0 {
            return;
        }
        let target = shared.target_bytes.load(Ordering::Acquire);

        let low_water = *PARAMS.low_water_frames.read().unwrap() * frame_bytes;
        let budget = if ring.used_space() < low_water {
            *PARAMS.refill_attempts_low.read().unwrap()
        } else {
            *PARAMS.refill_attempts_topup.read().unwrap()
        };

        let mut decoder = decoder.lock().unwrap();
        let mut pcm = shared.decode_pcm.lock().unwrap();
        let mut bytes = shared.decode_bytes.lock().unwrap();
        let scratch_frames = pcm.len() / (frame_bytes / 2);
        let mut zero_runs = 0u32;

        for _ in 0..budget {
            if ring.used_space() >= target {
                break;
            }
            if !Self::decode_step(
                decoder.as_mut(),
                shared,
                &ring,
                &mut pcm,
                &mut bytes,
                scratch_frames,
                frame_bytes,
                &mut zero_runs,
            ) {
                break;
            }
        }
    }

    /// Provider callback: drain whole frames from the ring, or synthesize
    /// the test tone. Torn-down state reads as "zero frames available".
    fn make_provider(shared: Arc<SessionShared>, channels: usize) -> SampleProvider {
        Box::new(move |dst, max_frames| {
            if shared.tone_mode.load(Ordering::Acquire) {
                if let Ok(mut guard) = shared.tone.try_lock() {
                    if let Some(tone) = guard.as_mut() {
                        return tone.fill(dst, max_frames, channels);
                    }
                }
                return 0;
            }

            let ring = match shared.ring.try_read() {
                Ok(guard) => match guard.as_ref() {
                    Some(r) => Arc::clone(r),
                    None => return 0,
                },
                Err(_) => return 0,
            };

            let frame_bytes = channels * 2;
            let mut buf = match shared.provider_bytes.try_lock() {
                Ok(b) => b,
                Err(_) => return 0,
            };

            let want = (max_frames * frame_bytes).min(buf.len());
            let got = ring.read(&mut buf[..want]);
            let frames = got / frame_bytes;
            // A read can split a frame across calls only if the producer
            // wrote a partial frame, which decode_step never does.
            let samples = frames * channels;
            for i in 0..samples {
                dst[i] = i16::from_le_bytes([buf[2 * i], buf[2 * i + 1]]);
            }
            frames
        })
    }

    /// Arm the refill timer and its single-slot service queue.
    fn spawn_refill_tasks(&self) {
        self.shared.running.store(true, Ordering::Release);
        self.shared.service_pending.store(false, Ordering::Release);

        let (tx, mut rx) = mpsc::channel::<()>(1);

        let timer_shared = Arc::clone(&self.shared);
        let period = *PARAMS.refill_period_ms.read().unwrap();
        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(period.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !timer_shared.running.load(Ordering::Acquire) {
                    break;
                }
                if timer_shared.eof.load(Ordering::Acquire)
                    || timer_shared.tone_mode.load(Ordering::Acquire)
                {
                    continue;
                }

                let below_target = {
                    let guard = timer_shared.ring.read().unwrap();
                    match guard.as_ref() {
                        Some(ring) => {
                            ring.used_space()
                                < timer_shared.target_bytes.load(Ordering::Acquire)
                        }
                        None => false,
                    }
                };
                if !below_target {
                    continue;
                }

                if !timer_shared.service_pending.swap(true, Ordering::AcqRel)
                    && tx.try_send(()).is_err()
                {
                    timer_shared.service_pending.store(false, Ordering::Release);
                }
            }
        });

        let service_shared = Arc::clone(&self.shared);
        let service_decoder = Arc::clone(&self.decoder);
        let service = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                if !service_shared.running.load(Ordering::Acquire) {
                    break;
                }
                Self::refill_pass(&service_shared, &service_decoder);
                service_shared.service_pending.store(false, Ordering::Release);
            }
        });

        *self.timer_task.lock().unwrap() = Some(timer);
        *self.service_task.lock().unwrap() = Some(service);
    }

    /// Halt the output and refill machinery; the loaded stream survives.
    fn teardown_session(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.timer_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.service_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(engine) = self.engine.lock().unwrap().take() {
            engine.stop();
        }
        self.shared.service_pending.store(false, Ordering::Release);
        self.shared.tone_mode.store(false, Ordering::Release);
        self.shared.out_rate.store(0, Ordering::Release);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.teardown_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::SilenceDecoder;
    use crate::audio::hal::LoopbackBackend;

    fn silence_player(total_frames: u64) -> (Arc<LoopbackBackend>, Player) {
        let backend = Arc::new(LoopbackBackend::new());
        let decoder = SilenceDecoder::new(
            StreamInfo {
                sample_rate: 44_100,
                channels: 2,
            },
            total_frames,
        );
        let player = Player::with_decoder(
            Arc::clone(&backend) as Arc<dyn PwmBackend>,
            PlayerConfig {
                pins: OutputPins::new(26, 27),
                buffer_ms: Some(100),
            },
            Box::new(decoder),
        );
        (backend, player)
    }

    #[tokio::test]
    async fn test_load_clamps_channel_count() {
        // A decoder claiming more channels than the output supports must
        // not break the frame accounting anywhere downstream.
        let backend = Arc::new(LoopbackBackend::new());
        let decoder = SilenceDecoder::new(
            StreamInfo {
                sample_rate: 44_100,
                channels: 4,
            },
            10_000_000,
        );
        let player = Player::with_decoder(
            Arc::clone(&backend) as Arc<dyn PwmBackend>,
            PlayerConfig {
                pins: OutputPins::new(26, 27),
                buffer_ms: Some(100),
            },
            Box::new(decoder),
        );

        player.load(Path::new("silence")).unwrap();
        assert_eq!(player.stats().channels, 2);

        player.play().unwrap();
        let engine = player.output().unwrap();
        assert_eq!(engine.channels(), 2);
        for _ in 0..8 {
            engine.on_batch_complete();
        }
        player.stop();
    }

    #[tokio::test]
    async fn test_diag_counters_advance_during_playback() {
        let (_backend, player) = silence_player(10_000_000);
        assert_eq!(player.diag().frames_decoded, 0);

        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        let after_predecode = player.diag().frames_decoded;
        assert!(after_predecode > 0, "predecode must register decoded frames");

        // Consume and let the refill service decode more
        let engine = player.output().unwrap();
        for _ in 0..10 {
            engine.on_batch_complete();
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        assert!(player.diag().frames_decoded > after_predecode);
        assert_eq!(player.diag().zero_yields, 0);
        player.stop();
    }

    #[tokio::test]
    async fn test_tone_pauses_ring_refill() {
        let (_backend, player) = silence_player(10_000_000);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();
        player.test_tone(1_000).unwrap();

        // Tone synthesis neither drains the ring nor lets the timer top
        // it up; occupancy stays where the stream session left it.
        let before = player.stats().used_bytes;
        let decoded_before = player.diag().frames_decoded;
        let engine = player.output().unwrap();
        for _ in 0..6 {
            engine.on_batch_complete();
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        assert_eq!(player.stats().used_bytes, before);
        assert_eq!(player.diag().frames_decoded, decoded_before);
        player.stop();
    }

    #[tokio::test]
    async fn test_play_from_idle_rejected() {
        let (_backend, player) = silence_player(100_000);
        assert!(matches!(player.play(), Err(Error::InvalidState(_))));
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn test_load_transitions_to_loaded() {
        let (_backend, player) = silence_player(100_000);
        player.load(Path::new("silence")).unwrap();
        assert_eq!(player.state(), PlayerState::Loaded);

        let stats = player.stats();
        assert_eq!(stats.sample_rate, 44_100);
        assert_eq!(stats.channels, 2);
        assert!(stats.target_bytes > 0);
        assert!(stats.target_bytes < stats.used_bytes + stats.free_bytes + 1);
    }

    #[tokio::test]
    async fn test_load_while_playing_rejected() {
        let (_backend, player) = silence_player(10_000_000);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(player.load(Path::new("silence")).is_err());
        player.stop();
    }

    #[tokio::test]
    async fn test_silence_end_to_end() {
        let (backend, player) = silence_player(10_000_000);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        // Give the refill timer a few periods to top the ring back up after
        // the output prefill drained two batches.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = player.stats();
        assert_eq!(stats.state, PlayerState::Playing);
        assert!(
            stats.used_bytes >= stats.target_bytes / 2,
            "predecode must reach half the high-water mark: {}/{}",
            stats.used_bytes,
            stats.target_bytes
        );
        assert!(backend.state().enabled);

        player.stop();
        let stats = player.stats();
        assert_eq!(stats.state, PlayerState::Idle);
        assert_eq!(stats.used_bytes, 0);
        assert!(!backend.state().enabled);
    }

    #[tokio::test]
    async fn test_rate_scaling_configures_output() {
        let (_backend, player) = silence_player(10_000_000);
        player.set_rate(200.0);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        let out = player.out_rate();
        let rel_err = (f64::from(out) - 88_200.0).abs() / 88_200.0;
        assert!(rel_err < 0.001, "out_rate={}", out);
        player.stop();
    }

    #[tokio::test]
    async fn test_set_rate_clamps() {
        let (_backend, player) = silence_player(10_000_000);
        player.set_rate(500.0); // clamped to 200%
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();
        let rel_err = (f64::from(player.out_rate()) - 88_200.0).abs() / 88_200.0;
        assert!(rel_err < 0.001);
        player.stop();
    }

    #[tokio::test]
    async fn test_eof_derived_after_drain() {
        // Short enough to be fully decoded during predecode, long enough
        // that the two-batch output prefill does not drain it immediately
        let (_backend, player) = silence_player(1_500);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        assert!(player.stats().eof, "decoder must be exhausted at startup");
        assert_eq!(player.state(), PlayerState::Playing, "ring still holds data");

        // Drive completions until the provider drains the ring
        let engine = player.output().unwrap();
        for _ in 0..64 {
            engine.on_batch_complete();
            if player.state() == PlayerState::Eof {
                break;
            }
        }
        assert_eq!(player.state(), PlayerState::Eof);
        player.stop();
    }

    #[tokio::test]
    async fn test_play_from_eof_rewinds() {
        let (_backend, player) = silence_player(1_500);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        let engine = player.output().unwrap();
        for _ in 0..64 {
            engine.on_batch_complete();
            if player.state() == PlayerState::Eof {
                break;
            }
        }
        assert_eq!(player.state(), PlayerState::Eof);

        player.play().unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(player.stats().used_bytes > 0);
        player.stop();
    }

    #[tokio::test]
    async fn test_tone_from_idle() {
        let (backend, player) = silence_player(0);
        player.test_tone(440).unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(backend.state().enabled);

        // Tone provider fills full batches, so completions never underrun
        let engine = player.output().unwrap();
        let before = engine.underrun_count();
        for _ in 0..4 {
            engine.on_batch_complete();
        }
        assert_eq!(engine.underrun_count(), before);

        // Armed batches carry a non-constant waveform
        let (left, _right) = backend.state().last_batch.unwrap();
        assert!(left.iter().any(|&v| v != left[0]));

        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test]
    async fn test_tone_while_playing_switches_provider() {
        let (backend, player) = silence_player(10_000_000);
        player.load(Path::new("silence")).unwrap();
        player.play().unwrap();

        player.test_tone(1_000).unwrap();
        assert_eq!(player.state(), PlayerState::Playing);

        let engine = player.output().unwrap();
        engine.on_batch_complete();
        engine.on_batch_complete();
        let (left, _right) = backend.state().last_batch.unwrap();
        assert!(
            left.iter().any(|&v| v != left[0]),
            "tone must replace silence in armed batches"
        );
        player.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_from_any_state() {
        let (_backend, player) = silence_player(10_000_000);
        player.stop(); // from Idle
        player.load(Path::new("silence")).unwrap();
        player.stop(); // from Loaded
        assert_eq!(player.state(), PlayerState::Idle);
    }
}
