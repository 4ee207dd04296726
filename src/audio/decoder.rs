//! Streaming audio decoder using symphonia
//!
//! Unlike a whole-file decode, the playback refill path pulls a bounded
//! number of frames at a time, so the decoder keeps its format reader and
//! codec state open across calls and drains leftover packet samples before
//! reading the next packet. Decodes MP3, FLAC, Vorbis and WAV/PCM to
//! interleaved signed 16-bit samples.

use crate::audio::types::StreamInfo;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Result of one bounded decode pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Produced this many frames of interleaved PCM
    Pcm(usize),

    /// Nothing available right now: end of stream, or a recoverable packet
    /// error that yielded no samples. Check `is_end_of_stream()`.
    NeedData,

    /// Decoder state is unrecoverable; the session must end
    Fatal,
}

/// Cumulative per-stream decode counters, reset on `open()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeDiagnostics {
    /// Total frames produced since open
    pub frames_decoded: u64,

    /// Calls that produced zero frames without reaching end of stream
    pub zero_yields: u64,
}

/// Incremental PCM source feeding the playback ring buffer.
///
/// `decode()` is called from the cooperative refill pass with a small frame
/// budget; it must return promptly rather than decode ahead. Implementations
/// report interleaved samples matching the channel count from `open()`.
pub trait Decoder: Send {
    /// Open a stream and report its metadata. Resets diagnostics.
    fn open(&mut self, path: &Path) -> Result<StreamInfo>;

    /// Decode up to `max_frames` frames of interleaved PCM into `dst`.
    ///
    /// `dst` must hold at least `max_frames * channels` samples.
    fn decode(&mut self, dst: &mut [i16], max_frames: usize) -> DecodeOutcome;

    /// True once the underlying stream is exhausted.
    fn is_end_of_stream(&self) -> bool;

    /// Restart the stream from the beginning.
    fn rewind(&mut self) -> Result<()>;

    /// Release the stream. Safe to call when nothing is open.
    fn close(&mut self);

    fn diagnostics(&self) -> DecodeDiagnostics;
}

/// Open symphonia state for one stream.
struct OpenStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    info: StreamInfo,

    /// Interleaved samples decoded but not yet handed out. A packet often
    /// yields more frames than one pull's budget.
    pending: Vec<i16>,
    pending_pos: usize,

    sample_buf: Option<SampleBuffer<i16>>,
}

/// File-backed [`Decoder`] over symphonia's probe/format/codec stack.
pub struct SymphoniaDecoder {
    path: Option<PathBuf>,
    stream: Option<OpenStream>,
    eof: bool,
    diag: DecodeDiagnostics,
}

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self {
            path: None,
            stream: None,
            eof: false,
            diag: DecodeDiagnostics::default(),
        }
    }

    fn open_stream(path: &Path) -> Result<OpenStream> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Decode(format!("failed to open {}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("failed to probe format: {}", e)))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("no audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("sample rate not found".to_string()))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("channel count not found".to_string()))?;
        if channels == 0 || channels > 2 {
            return Err(Error::Decode(format!(
                "unsupported channel count: {}",
                channels
            )));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("failed to create decoder: {}", e)))?;

        debug!(
            "Opened {}: sample_rate={} channels={}",
            path.display(),
            sample_rate,
            channels
        );

        Ok(OpenStream {
            format,
            decoder,
            track_id,
            info: StreamInfo {
                sample_rate,
                channels,
            },
            pending: Vec::new(),
            pending_pos: 0,
            sample_buf: None,
        })
    }

    /// Move buffered samples into `dst`, whole frames only.
    fn drain_pending(stream: &mut OpenStream, dst: &mut [i16], max_frames: usize) -> usize {
        let ch = stream.info.channels as usize;
        let available = (stream.pending.len() - stream.pending_pos) / ch;
        let frames = available.min(max_frames).min(dst.len() / ch);
        if frames == 0 {
            return 0;
        }

        let n = frames * ch;
        dst[..n].copy_from_slice(&stream.pending[stream.pending_pos..stream.pending_pos + n]);
        stream.pending_pos += n;
        if stream.pending_pos >= stream.pending.len() {
            stream.pending.clear();
            stream.pending_pos = 0;
        }
        frames
    }
}

impl Default for SymphoniaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self, path: &Path) -> Result<StreamInfo> {
        let stream = Self::open_stream(path)?;
        let info = stream.info;
        self.path = Some(path.to_path_buf());
        self.stream = Some(stream);
        self.eof = false;
        self.diag = DecodeDiagnostics::default();
        Ok(info)
    }

    fn decode(&mut self, dst: &mut [i16], max_frames: usize) -> DecodeOutcome {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return DecodeOutcome::Fatal,
        };
        if max_frames == 0 {
            return DecodeOutcome::NeedData;
        }

        // Leftovers from the previous packet first
        let drained = Self::drain_pending(stream, dst, max_frames);
        if drained > 0 {
            self.diag.frames_decoded += drained as u64;
            return DecodeOutcome::Pcm(drained);
        }
        if self.eof {
            return DecodeOutcome::NeedData;
        }

        loop {
            let packet = match stream.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Reached end of stream");
                    self.eof = true;
                    return DecodeOutcome::NeedData;
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Stream requires decoder reset; ending session");
                    return DecodeOutcome::Fatal;
                }
                Err(e) => {
                    warn!("Error reading packet: {}", e);
                    self.diag.zero_yields += 1;
                    return DecodeOutcome::NeedData;
                }
            };

            if packet.track_id() != stream.track_id {
                continue;
            }

            match stream.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let duration = decoded.capacity() as u64;
                    // Packets can grow; reallocate the staging buffer if so
                    let too_small = matches!(
                        &stream.sample_buf,
                        Some(buf) if buf.capacity() < duration as usize * spec.channels.count()
                    );
                    if too_small {
                        stream.sample_buf = None;
                    }
                    let buf = stream
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::<i16>::new(duration, spec));
                    buf.copy_interleaved_ref(decoded);
                    stream.pending.extend_from_slice(buf.samples());

                    let frames = Self::drain_pending(stream, dst, max_frames);
                    if frames == 0 {
                        // Decoded packet carried no audio (e.g. priming)
                        continue;
                    }
                    self.diag.frames_decoded += frames as u64;
                    return DecodeOutcome::Pcm(frames);
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Decoder requires reset; ending session");
                    return DecodeOutcome::Fatal;
                }
                Err(e) => {
                    // Corrupt packet: skip it and let the caller retry
                    warn!("Decode error: {}", e);
                    self.diag.zero_yields += 1;
                    return DecodeOutcome::NeedData;
                }
            }
        }
    }

    fn is_end_of_stream(&self) -> bool {
        self.eof
    }

    /// Restart by reopening from the file start. Compressed seek tables are
    /// unreliable across formats, so decode-from-start is the only seek.
    fn rewind(&mut self) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| Error::InvalidState("no stream open".to_string()))?;
        let stream = Self::open_stream(&path)?;
        self.stream = Some(stream);
        self.eof = false;
        self.diag = DecodeDiagnostics::default();
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.path = None;
        self.eof = false;
    }

    fn diagnostics(&self) -> DecodeDiagnostics {
        self.diag
    }
}

/// Fixed-length silence source for tests and bring-up.
///
/// Produces `total_frames` of zero samples at the configured format, then
/// reports end of stream.
pub struct SilenceDecoder {
    info: StreamInfo,
    total_frames: u64,
    remaining: u64,
    open: bool,
    diag: DecodeDiagnostics,
}

impl SilenceDecoder {
    pub fn new(info: StreamInfo, total_frames: u64) -> Self {
        Self {
            info,
            total_frames,
            remaining: 0,
            open: false,
            diag: DecodeDiagnostics::default(),
        }
    }
}

impl Decoder for SilenceDecoder {
    fn open(&mut self, _path: &Path) -> Result<StreamInfo> {
        self.remaining = self.total_frames;
        self.open = true;
        self.diag = DecodeDiagnostics::default();
        Ok(self.info)
    }

    fn decode(&mut self, dst: &mut [i16], max_frames: usize) -> DecodeOutcome {
        if !self.open {
            return DecodeOutcome::Fatal;
        }
        let ch = self.info.channels as usize;
        let frames = (self.remaining as usize)
            .min(max_frames)
            .min(dst.len() / ch);
        if frames == 0 {
            return DecodeOutcome::NeedData;
        }

        dst[..frames * ch].fill(0);
        self.remaining -= frames as u64;
        self.diag.frames_decoded += frames as u64;
        DecodeOutcome::Pcm(frames)
    }

    fn is_end_of_stream(&self) -> bool {
        self.open && self.remaining == 0
    }

    fn rewind(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::InvalidState("no stream open".to_string()));
        }
        self.remaining = self.total_frames;
        self.diag = DecodeDiagnostics::default();
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.remaining = 0;
    }

    fn diagnostics(&self) -> DecodeDiagnostics {
        self.diag
    }
}
