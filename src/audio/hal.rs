//! Hardware seam for the PWM/DMA output path
//!
//! The output engine talks to hardware only through [`PwmBackend`]: pin and
//! timing configuration, duty levels, and DMA batch transfers. A target port
//! implements this over the real PWM slice and DMA channels; the in-crate
//! [`LoopbackBackend`] records every call so tests can drive the ping-pong
//! cycle deterministically.
//!
//! Transfer completion flows the other way: the hardware glue (or a test)
//! calls `AudioOutputEngine::on_batch_complete()` from its interrupt context.

use crate::audio::rate::PwmTiming;
use crate::audio::types::OutputPins;
use crate::error::Result;
use std::sync::Mutex;

/// Hardware operations required by the output engine.
///
/// All methods may be called from the completion-interrupt context and must
/// not block or allocate. `arm_transfer` receives the level buffers for one
/// batch; the backend must begin streaming them to the two PWM compare
/// registers and deliver exactly one completion per armed batch.
pub trait PwmBackend: Send + Sync {
    /// Claim pins/slice/DMA channels and program wrap + divider.
    /// Output stays disabled until `set_enabled(true)`.
    fn configure(&self, pins: OutputPins, timing: &PwmTiming) -> Result<()>;

    /// Force both channels to a fixed duty level (used for silence).
    fn set_idle_levels(&self, level: u16);

    /// Enable or disable the PWM counter (and with it, DMA pacing requests).
    fn set_enabled(&self, enabled: bool);

    /// Begin one DMA batch pair. `left` and `right` have equal length.
    fn arm_transfer(&self, left: &[u16], right: &[u16]) -> Result<()>;

    /// Abort any in-flight transfers. Idempotent.
    fn abort_transfers(&self);

    /// Release exclusively-claimed hardware channels so a later
    /// `configure()` can reclaim them. Idempotent.
    fn release(&self);
}

/// Recorded state of one [`LoopbackBackend`] call history.
#[derive(Debug, Default, Clone)]
pub struct LoopbackState {
    /// Last configured pins/timing, if any
    pub configured: Option<(OutputPins, PwmTiming)>,

    /// Whether output is currently enabled
    pub enabled: bool,

    /// Idle level last forced onto both channels
    pub idle_level: Option<u16>,

    /// Number of batches armed since creation
    pub transfers_armed: u64,

    /// Level data of the most recently armed batch
    pub last_batch: Option<(Vec<u16>, Vec<u16>)>,

    /// Number of abort calls
    pub aborts: u64,

    /// Whether channels are currently claimed
    pub claimed: bool,
}

/// Backend test double: records configuration and armed batches.
///
/// Completions are not generated automatically — tests call
/// `AudioOutputEngine::on_batch_complete()` themselves, standing in for the
/// DMA interrupt.
#[derive(Debug, Default)]
pub struct LoopbackBackend {
    state: Mutex<LoopbackState>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded call history.
    pub fn state(&self) -> LoopbackState {
        self.state.lock().unwrap().clone()
    }
}

impl PwmBackend for LoopbackBackend {
    fn configure(&self, pins: OutputPins, timing: &PwmTiming) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.configured = Some((pins, *timing));
        s.claimed = true;
        Ok(())
    }

    fn set_idle_levels(&self, level: u16) {
        self.state.lock().unwrap().idle_level = Some(level);
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    fn arm_transfer(&self, left: &[u16], right: &[u16]) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.transfers_armed += 1;
        s.last_batch = Some((left.to_vec(), right.to_vec()));
        Ok(())
    }

    fn abort_transfers(&self) {
        self.state.lock().unwrap().aborts += 1;
    }

    fn release(&self) {
        self.state.lock().unwrap().claimed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::rate;

    #[test]
    fn test_loopback_records_lifecycle() {
        let backend = LoopbackBackend::new();
        let timing = rate::fit(44_100, 125_000_000).unwrap();

        backend
            .configure(OutputPins::new(26, 27), &timing)
            .unwrap();
        backend.set_enabled(true);
        backend.arm_transfer(&[1, 2, 3], &[4, 5, 6]).unwrap();
        backend.abort_transfers();
        backend.set_enabled(false);
        backend.release();

        let s = backend.state();
        assert_eq!(s.configured.unwrap().0, OutputPins::new(26, 27));
        assert!(!s.enabled);
        assert_eq!(s.transfers_armed, 1);
        assert_eq!(s.last_batch.unwrap().0, vec![1, 2, 3]);
        assert_eq!(s.aborts, 1);
        assert!(!s.claimed);
    }
}
