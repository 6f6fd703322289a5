/// WAV file audio backend
///
/// Replays a 16-bit PCM WAV file as if it were a microphone. Useful for
/// offline runs of the service and for deterministic end-to-end tests.

use crate::audio::{AudioBackend, AudioDevice, AudioError, AudioSample, AudioStream, StreamParams};
use hound::{SampleFormat as WavSampleFormat, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Backend that opens a WAV file per run
#[derive(Debug, Clone)]
pub struct WavBackend {
    path: PathBuf,
    realtime: bool,
}

impl WavBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            realtime: false,
        }
    }

    /// Pace reads at one frame duration, like a live device
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl AudioBackend for WavBackend {
    fn open_device(&self) -> Result<Box<dyn AudioDevice>, AudioError> {
        if !self.path.exists() {
            return Err(AudioError::DeviceNotFound(self.path.display().to_string()));
        }

        Ok(Box::new(WavDevice {
            path: self.path.clone(),
            realtime: self.realtime,
            terminated: false,
        }))
    }
}

struct WavDevice {
    path: PathBuf,
    realtime: bool,
    terminated: bool,
}

impl AudioDevice for WavDevice {
    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn AudioStream>, AudioError> {
        if self.terminated {
            return Err(AudioError::Closed);
        }

        let reader = WavReader::open(&self.path)?;
        let spec = reader.spec();

        if spec.sample_format != WavSampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} must be 16-bit integer PCM, found {}-bit {:?}",
                self.path.display(),
                spec.bits_per_sample,
                spec.sample_format
            )));
        }

        if spec.sample_rate != params.sample_rate || spec.channels != params.channels {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} is {} Hz / {} ch, stream wants {} Hz / {} ch",
                self.path.display(),
                spec.sample_rate,
                spec.channels,
                params.sample_rate,
                params.channels
            )));
        }

        info!(
            "Replaying {} ({} samples at {} Hz)",
            self.path.display(),
            reader.len(),
            spec.sample_rate
        );

        Ok(Box::new(WavStream {
            reader: Some(reader),
            channels: params.channels as usize,
            pace: self.realtime.then(|| params.frame_duration()),
            next_deadline: None,
            active: true,
        }))
    }

    fn terminate(&mut self) -> Result<(), AudioError> {
        self.terminated = true;
        debug!("WAV device terminated");
        Ok(())
    }
}

struct WavStream {
    reader: Option<WavReader<BufReader<File>>>,
    channels: usize,
    pace: Option<Duration>,
    next_deadline: Option<Instant>,
    active: bool,
}

impl AudioStream for WavStream {
    fn read(&mut self, frame_size: usize) -> Result<Vec<AudioSample>, AudioError> {
        let reader = self.reader.as_mut().ok_or(AudioError::Closed)?;
        let wanted = frame_size * self.channels;

        let mut frame = Vec::with_capacity(wanted);
        for sample in reader.samples::<i16>().take(wanted) {
            frame.push(sample?);
        }

        if frame.is_empty() {
            return Err(AudioError::EndOfStream);
        }
        // Zero-pad the tail of the file to a full frame
        frame.resize(wanted, 0);

        if let Some(pace) = self.pace {
            let deadline = self.next_deadline.unwrap_or_else(Instant::now) + pace;
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.next_deadline = Some(deadline);
        }

        Ok(frame)
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.active = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.active = false;
        self.reader = None;
        Ok(())
    }
}
