/// Wake-word listener library
///
/// Runs wake-word detection on a supervised background worker: audio frames
/// are pulled from an audio backend, fed to a wake-word engine, and registered
/// callbacks fire on every match.

pub mod audio;
pub mod capture;
pub mod config;
pub mod controller;
pub mod engine;
pub mod frame_ring;
pub mod wav_source;

// Re-export main types
pub use audio::{AudioBackend, AudioDevice, AudioError, AudioSample, AudioStream, SampleFormat, StreamParams};
pub use capture::CpalBackend;
pub use config::{AudioInput, ConfigError, EngineConfig, ListenerConfig};
pub use controller::{
    ControllerError, ControllerState, ControllerStats, DetectionController, DetectorSettings,
    ResourceStatus, Sensitivity,
};
pub use engine::{EnergyEngine, EnergyEngineFactory, EngineError, EngineFactory, WakeEngine};
pub use frame_ring::{frame_ring, FrameReader, FrameWriter};
pub use wav_source::WavBackend;

/// Default capture sample rate (16 kHz mono PCM)
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame size in samples (32ms at 16kHz)
pub const FRAME_SIZE: usize = 512;
