/// Wake-word engine capability
///
/// An engine is built once per detection run from the configured model paths
/// and a comma-separated sensitivity string, then fed one PCM frame at a time.
/// A vendor SDK plugs in by implementing `EngineFactory` and `WakeEngine`.
///
/// `EnergyEngine` is the built-in stand-in used when no SDK is linked: it
/// "detects" sustained high-energy audio, which is enough to drive the
/// service end to end and in tests.

use crate::audio::AudioSample;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Init(String),

    #[error("Invalid sensitivity: {0}")]
    InvalidSensitivity(String),

    #[error("Detection error: {0}")]
    Detection(String),
}

/// Builds engine instances for a detection run
#[cfg_attr(test, mockall::automock)]
pub trait EngineFactory: Send + Sync {
    fn create(&self, model_paths: &[String], sensitivity: &str) -> Result<Box<dyn WakeEngine>, EngineError>;
}

/// A live wake-word engine
#[cfg_attr(test, mockall::automock)]
pub trait WakeEngine: Send {
    /// Run detection on one frame. Returns the zero-based index of the
    /// matched model, or `None`.
    fn run_detection(&mut self, frame: &[AudioSample]) -> Result<Option<usize>, EngineError>;

    /// Clear internal detection state after a match
    fn reset(&mut self);
}

/// Join per-model sensitivities into the engine's string form ("0.5,0.6")
pub fn format_sensitivities(sensitivities: &[f32]) -> String {
    sensitivities
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated sensitivity string
pub fn parse_sensitivities(sensitivity: &str) -> Result<Vec<f32>, EngineError> {
    sensitivity
        .split(',')
        .map(|part| {
            let value: f32 = part
                .trim()
                .parse()
                .map_err(|_| EngineError::InvalidSensitivity(format!("'{}' is not a number", part)))?;

            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::InvalidSensitivity(format!(
                    "{} is outside 0.0 - 1.0",
                    value
                )));
            }

            Ok(value)
        })
        .collect()
}

/// RMS level at sensitivity 0.0; sensitivity 1.0 fires on any sound
const MAX_RMS_THRESHOLD: f32 = 0.8;

/// Frames above threshold needed to fire
pub const DEFAULT_HOLD_FRAMES: usize = 3;

/// Factory for `EnergyEngine`
#[derive(Debug, Clone)]
pub struct EnergyEngineFactory {
    hold_frames: usize,
}

impl EnergyEngineFactory {
    pub fn new(hold_frames: usize) -> Self {
        Self {
            hold_frames: hold_frames.max(1),
        }
    }
}

impl Default for EnergyEngineFactory {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD_FRAMES)
    }
}

impl EngineFactory for EnergyEngineFactory {
    fn create(&self, model_paths: &[String], sensitivity: &str) -> Result<Box<dyn WakeEngine>, EngineError> {
        let engine = EnergyEngine::new(model_paths, sensitivity, self.hold_frames)?;
        info!(
            "Energy engine loaded {} model(s), thresholds {:?}, hold {} frames",
            model_paths.len(),
            engine.thresholds(),
            self.hold_frames
        );
        Ok(Box::new(engine))
    }
}

/// Energy-threshold wake-word engine
///
/// Each model gets an RMS threshold derived from its sensitivity. After
/// `hold_frames` consecutive frames above the lowest threshold, the first
/// model whose threshold the current frame exceeds is reported.
#[derive(Debug)]
pub struct EnergyEngine {
    thresholds: Vec<f32>,
    hold_frames: usize,
    frames_above: usize,
}

impl EnergyEngine {
    pub fn new(model_paths: &[String], sensitivity: &str, hold_frames: usize) -> Result<Self, EngineError> {
        if model_paths.is_empty() {
            return Err(EngineError::Init("At least one model path is required".to_string()));
        }

        let sensitivities = parse_sensitivities(sensitivity)?;
        if sensitivities.len() != model_paths.len() {
            return Err(EngineError::Init(format!(
                "{} sensitivities given for {} models",
                sensitivities.len(),
                model_paths.len()
            )));
        }

        for path in model_paths {
            if !Path::new(path).exists() {
                // Models are opaque to this engine
                warn!("Model file not found: {}", path);
            }
        }

        let thresholds: Vec<f32> = sensitivities
            .iter()
            .map(|s| (1.0 - s) * MAX_RMS_THRESHOLD)
            .collect();

        Ok(Self {
            thresholds,
            hold_frames: hold_frames.max(1),
            frames_above: 0,
        })
    }

    /// Normalized RMS of a frame (0.0 - 1.0)
    pub fn rms(frame: &[AudioSample]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }

        let energy: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();

        (energy / frame.len() as f64).sqrt() as f32
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }
}

impl WakeEngine for EnergyEngine {
    fn run_detection(&mut self, frame: &[AudioSample]) -> Result<Option<usize>, EngineError> {
        if frame.is_empty() {
            return Err(EngineError::Detection("Empty frame".to_string()));
        }

        let rms = Self::rms(frame);
        let lowest = self.thresholds.iter().cloned().fold(f32::INFINITY, f32::min);

        if rms <= lowest {
            self.frames_above = 0;
            return Ok(None);
        }

        self.frames_above += 1;
        trace!("Frame rms={:.3} above threshold ({} in a row)", rms, self.frames_above);

        if self.frames_above < self.hold_frames {
            return Ok(None);
        }

        Ok(self.thresholds.iter().position(|&t| rms > t))
    }

    fn reset(&mut self) {
        self.frames_above = 0;
        debug!("Energy engine reset");
    }
}
