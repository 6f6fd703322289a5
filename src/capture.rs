/// Microphone capture via cpal
///
/// cpal delivers audio through callbacks on its own thread and its `Stream`
/// is not `Send`, so each opened stream lives on a dedicated `audio-capture`
/// thread. The callback pushes samples into a frame ring; `read` on the
/// worker side blocks until a full frame is buffered.

use crate::audio::{AudioBackend, AudioDevice, AudioError, AudioSample, AudioStream, StreamParams};
use crate::frame_ring::{frame_ring, FrameReader, FrameWriter};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Frames of headroom in the capture ring
pub const DEFAULT_RING_FRAMES: usize = 32;

/// How long a read waits for the device before failing
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

const OPEN_TIMEOUT: Duration = Duration::from_secs(3);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Audio backend for a cpal input device
#[derive(Debug, Clone)]
pub struct CpalBackend {
    device_name: Option<String>,
    ring_frames: usize,
    read_timeout: Duration,
}

impl CpalBackend {
    /// Use the named input device (substring match), or the host default
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            ring_frames: DEFAULT_RING_FRAMES,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_ring_frames(mut self, ring_frames: usize) -> Self {
        self.ring_frames = ring_frames.max(1);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AudioBackend for CpalBackend {
    fn open_device(&self) -> Result<Box<dyn AudioDevice>, AudioError> {
        let host = cpal::default_host();
        let device = find_input_device(&host, self.device_name.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio device: {}", name);

        Ok(Box::new(CpalDevice {
            // Resolved again on the capture thread; cpal devices stay there
            device_name: self.device_name.clone(),
            ring_frames: self.ring_frames,
            read_timeout: self.read_timeout,
            terminated: false,
        }))
    }
}

struct CpalDevice {
    device_name: Option<String>,
    ring_frames: usize,
    read_timeout: Duration,
    terminated: bool,
}

impl AudioDevice for CpalDevice {
    fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn AudioStream>, AudioError> {
        if self.terminated {
            return Err(AudioError::Closed);
        }

        let (writer, reader) = frame_ring(params.samples_per_frame() * self.ring_frames);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let failed = Arc::new(AtomicBool::new(false));

        let device_name = self.device_name.clone();
        let thread_params = params.clone();
        let thread_failed = Arc::clone(&failed);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_capture_thread(device_name, thread_params, writer, thread_failed, ready_tx, stop_rx);
            })
            .map_err(|e| AudioError::StreamBuild(format!("Failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stop_tx.send(());
                return Err(AudioError::StreamBuild("Audio device did not start in time".to_string()));
            }
        }

        debug!(
            "Capture stream open: {} Hz, {} ch, {} samples/frame, ring {} samples",
            params.sample_rate,
            params.channels,
            params.frame_size,
            reader.capacity()
        );

        Ok(Box::new(CpalStream {
            reader: Some(reader),
            stop_tx,
            thread: Some(handle),
            failed,
            read_timeout: self.read_timeout,
            channels: params.channels as usize,
        }))
    }

    fn terminate(&mut self) -> Result<(), AudioError> {
        self.terminated = true;
        debug!("Audio device terminated");
        Ok(())
    }
}

struct CpalStream {
    reader: Option<FrameReader>,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    read_timeout: Duration,
    channels: usize,
}

impl AudioStream for CpalStream {
    fn read(&mut self, frame_size: usize) -> Result<Vec<AudioSample>, AudioError> {
        let wanted = frame_size * self.channels;
        let deadline = Instant::now() + self.read_timeout;
        let reader = self.reader.as_mut().ok_or(AudioError::Closed)?;

        loop {
            if let Some(frame) = reader.pop_frame(wanted) {
                return Ok(frame);
            }

            if self.failed.load(Ordering::Acquire) {
                return Err(AudioError::Stream("Capture device reported an error".to_string()));
            }

            if self.thread.is_none() {
                return Err(AudioError::Closed);
            }

            if Instant::now() >= deadline {
                return Err(AudioError::ReadTimeout(self.read_timeout.as_millis()));
            }

            thread::sleep(READ_POLL_INTERVAL);
        }
    }

    fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        let _ = self.stop_tx.send(());
        handle
            .join()
            .map_err(|_| AudioError::Stream("Audio capture thread panicked".to_string()))
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let stopped = self.stop();

        if let Some(reader) = self.reader.take() {
            let dropped = reader.dropped_samples();
            if dropped > 0 {
                warn!("Capture overflow dropped {} samples over the stream's lifetime", dropped);
            }
        }

        stopped
    }

    fn discard_buffered(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.clear();
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.reader.as_ref().map(|r| r.dropped_samples()).unwrap_or(0)
    }
}

/// Run one capture stream until told to stop
fn run_capture_thread(
    device_name: Option<String>,
    params: StreamParams,
    writer: FrameWriter,
    failed: Arc<AtomicBool>,
    ready_tx: Sender<Result<(), AudioError>>,
    stop_rx: Receiver<()>,
) {
    let stream = match build_stream(device_name.as_deref(), &params, writer, failed) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamBuild(format!("Failed to start audio stream: {}", e))));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    debug!("Audio capture thread started");

    // Wait for stop signal (or the stream handle being dropped)
    loop {
        match stop_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }

    debug!("Audio capture thread stopping");
    drop(stream);
}

fn build_stream(
    device_name: Option<&str>,
    params: &StreamParams,
    mut writer: FrameWriter,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)?;

    let ranges = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;
    let sample_format = choose_sample_format(ranges, params).ok_or_else(|| {
        AudioError::UnsupportedFormat(format!(
            "No 16-bit or float input at {} Hz with {} channel(s)",
            params.sample_rate, params.channels
        ))
    })?;

    let config = StreamConfig {
        channels: params.channels,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = move |err: cpal::StreamError| {
        error!("Audio stream error: {}", err);
        failed.store(true, Ordering::Release);
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                writer.push(data);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                writer.push(&samples);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AudioError::UnsupportedFormat(format!("Sample format {:?}", other)));
        }
    };

    stream.map_err(|e| AudioError::StreamBuild(e.to_string()))
}

/// Find an input device by name, or the host default
fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, AudioError> {
    let Some(name) = name else {
        return host.default_input_device().ok_or(AudioError::NoDevice);
    };

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", name, e)))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name.contains(name) {
                return Ok(device);
            }
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Pick a device sample format for the requested stream, preferring native 16-bit
fn choose_sample_format(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    params: &StreamParams,
) -> Option<cpal::SampleFormat> {
    let rate = SampleRate(params.sample_rate);
    let formats: Vec<cpal::SampleFormat> = ranges
        .filter(|r| r.channels() == params.channels)
        .filter(|r| r.min_sample_rate() <= rate && r.max_sample_rate() >= rate)
        .map(|r| r.sample_format())
        .collect();

    [cpal::SampleFormat::I16, cpal::SampleFormat::F32]
        .into_iter()
        .find(|f| formats.contains(f))
}

fn f32_to_i16(sample: f32) -> AudioSample {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as AudioSample
}
