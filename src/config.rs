/// Service configuration
///
/// Loaded from an optional JSON file, then overridden from `WAKEWORD_*`
/// environment variables. Converts into the controller's `DetectorSettings`.

use crate::controller::{DetectorSettings, Sensitivity, DEFAULT_JOIN_TIMEOUT, DEFAULT_PAUSE_POLL};
use crate::engine::DEFAULT_HOLD_FRAMES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where audio comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum AudioInput {
    /// Live capture; `device` is a name substring, `None` for the default input
    Microphone {
        #[serde(default)]
        device: Option<String>,
    },

    /// Replay of a 16-bit PCM WAV file
    Wav {
        path: PathBuf,
        #[serde(default)]
        realtime: bool,
    },
}

impl Default for AudioInput {
    fn default() -> Self {
        AudioInput::Microphone { device: None }
    }
}

/// Settings for the built-in energy engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hold_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_frames: DEFAULT_HOLD_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Wake-word model files, one per phrase
    pub model_paths: Vec<String>,

    /// Single value for all models or one per model
    pub sensitivity: Sensitivity,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub channels: u16,
    pub join_timeout_ms: u64,
    pub pause_poll_ms: u64,
    pub audio: AudioInput,
    pub engine: EngineConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            model_paths: Vec::new(),
            sensitivity: Sensitivity::default(),
            sample_rate: crate::SAMPLE_RATE,
            frame_size: crate::FRAME_SIZE,
            channels: 1,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
            pause_poll_ms: DEFAULT_PAUSE_POLL.as_millis() as u64,
            audio: AudioInput::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Load from `path` (or defaults), apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Loaded configuration from {}", path.display());
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply `WAKEWORD_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(paths) = lookup("WAKEWORD_MODEL_PATHS") {
            self.model_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
            debug!("Model paths from environment: {:?}", self.model_paths);
        }

        if let Some(value) = lookup("WAKEWORD_SENSITIVITY") {
            let values = value
                .split(',')
                .map(|part| part.trim().parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| env_error("WAKEWORD_SENSITIVITY", &value))?;

            self.sensitivity = match values.as_slice() {
                [single] => Sensitivity::Uniform(*single),
                _ => Sensitivity::PerModel(values),
            };
        }

        if let Some(value) = lookup("WAKEWORD_SAMPLE_RATE") {
            self.sample_rate = value.parse().map_err(|_| env_error("WAKEWORD_SAMPLE_RATE", &value))?;
        }

        if let Some(value) = lookup("WAKEWORD_FRAME_SIZE") {
            self.frame_size = value.parse().map_err(|_| env_error("WAKEWORD_FRAME_SIZE", &value))?;
        }

        if let Some(path) = lookup("WAKEWORD_WAV") {
            self.audio = AudioInput::Wav {
                path: PathBuf::from(path),
                realtime: true,
            };
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be greater than 0".to_string()));
        }

        if self.frame_size == 0 {
            return Err(ConfigError::Invalid("frame_size must be greater than 0".to_string()));
        }

        if self.channels == 0 {
            return Err(ConfigError::Invalid("channels must be greater than 0".to_string()));
        }

        if self.engine.hold_frames == 0 {
            return Err(ConfigError::Invalid("engine.hold_frames must be greater than 0".to_string()));
        }

        self.sensitivity
            .resolve(self.model_paths.len())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(())
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            model_paths: self.model_paths.clone(),
            sensitivity: self.sensitivity.clone(),
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
            channels: self.channels,
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            pause_poll: Duration::from_millis(self.pause_poll_ms),
        }
    }
}

fn env_error(var: &str, value: &str) -> ConfigError {
    ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    }
}
