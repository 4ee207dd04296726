//! Audio output path: timing fit, hardware seam, DMA engine, decoding

pub mod decoder;
pub mod hal;
pub mod output;
pub mod rate;
pub mod types;

pub use decoder::{DecodeDiagnostics, DecodeOutcome, Decoder, SilenceDecoder, SymphoniaDecoder};
pub use hal::{LoopbackBackend, PwmBackend};
pub use output::{AudioOutputEngine, OutputConfig, SampleProvider};
pub use rate::PwmTiming;
pub use types::{OutputPins, RateScale, StreamInfo};
