/// Audio source capability
///
/// The detection worker only talks to audio through these traits. A backend
/// hands out a device, a device opens a blocking PCM stream, and the stream
/// yields fixed-size frames. Implementations live in `capture` (microphone via
/// cpal) and `wav_source` (WAV file replay via hound).

use thiserror::Error;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No default input device available")]
    NoDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Timed out waiting {0}ms for a full frame")]
    ReadTimeout(u128),

    #[error("End of audio stream")]
    EndOfStream,

    #[error("Audio stream is closed")]
    Closed,

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// PCM sample encoding requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian integers
    I16,
}

/// Parameters for opening an input stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,

    /// Samples per channel in one frame
    pub frame_size: usize,
}

impl StreamParams {
    /// 16-bit PCM stream parameters
    pub fn pcm16(channels: u16, sample_rate: u32, frame_size: usize) -> Self {
        Self {
            format: SampleFormat::I16,
            channels,
            sample_rate,
            frame_size,
        }
    }

    /// Interleaved sample count of one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    /// Wall-clock duration of one frame
    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(
            self.frame_size as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64,
        )
    }
}

/// Factory for audio devices. Shared by the controller across runs.
pub trait AudioBackend: Send + Sync {
    fn open_device(&self) -> Result<Box<dyn AudioDevice>, AudioError>;
}

/// An opened audio device. Terminated once at the end of a run.
pub trait AudioDevice: Send {
    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn AudioStream>, AudioError>;

    fn terminate(&mut self) -> Result<(), AudioError>;
}

/// A blocking input stream.
///
/// `read` blocks for roughly one frame duration and returns exactly
/// `frame_size * channels` interleaved samples. Input overflow is never an
/// error: a backend that cannot keep up discards samples and reports them
/// through `dropped_samples`.
pub trait AudioStream: Send {
    fn read(&mut self, frame_size: usize) -> Result<Vec<AudioSample>, AudioError>;

    fn is_active(&self) -> bool;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn close(&mut self) -> Result<(), AudioError>;

    /// Drop input buffered while nobody was reading (e.g. during a pause).
    /// Sources without a capture buffer have nothing to discard.
    fn discard_buffered(&mut self) {}

    /// Samples discarded on overflow since the stream was opened
    fn dropped_samples(&self) -> u64 {
        0
    }
}
