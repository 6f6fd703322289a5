/// Detection lifecycle controller
///
/// Owns one background worker thread that holds the audio stream and the
/// wake-word engine for the length of a run. Callers drive it through a small
/// state machine (Idle -> Running <-> Paused -> Stopped) from any thread.
/// Nothing that fails inside the worker is returned to callers: a failed run
/// tears itself down and shows up as `is_running() == false` plus a log line.

use crate::audio::{AudioBackend, AudioDevice, AudioError, AudioStream, StreamParams};
use crate::engine::{format_sensitivities, EngineError, EngineFactory, WakeEngine};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Span};

/// Default bound on joining the worker in `stop`
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default sleep between paused-flag checks
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{sensitivities} sensitivities given for {models} model paths")]
    SensitivityMismatch { models: usize, sensitivities: usize },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Detection worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Per-model sensitivity (0.0 - 1.0, higher = more permissive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sensitivity {
    /// One value broadcast to every model
    Uniform(f32),

    /// One value per model path, in order
    PerModel(Vec<f32>),
}

impl Default for Sensitivity {
    fn default() -> Self {
        Sensitivity::Uniform(0.5)
    }
}

impl Sensitivity {
    /// Expand to one value per model
    pub fn resolve(&self, models: usize) -> Result<Vec<f32>, ControllerError> {
        let values = match self {
            Sensitivity::Uniform(value) => vec![*value; models],
            Sensitivity::PerModel(values) => {
                if values.len() != models {
                    return Err(ControllerError::SensitivityMismatch {
                        models,
                        sensitivities: values.len(),
                    });
                }
                values.clone()
            }
        };

        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(ControllerError::InvalidConfig(format!(
                "Sensitivity {} must be between 0.0 and 1.0",
                bad
            )));
        }

        Ok(values)
    }
}

/// Static configuration of a controller
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_paths: Vec<String>,
    pub sensitivity: Sensitivity,
    pub sample_rate: u32,

    /// Samples per channel fed to the engine at a time
    pub frame_size: usize,
    pub channels: u16,
    pub join_timeout: Duration,
    pub pause_poll: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_paths: Vec::new(),
            sensitivity: Sensitivity::default(),
            sample_rate: crate::SAMPLE_RATE,
            frame_size: crate::FRAME_SIZE,
            channels: 1,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            pause_poll: DEFAULT_PAUSE_POLL,
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Cumulative counters across all runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub runs_started: u64,
    pub frames_processed: u64,
    pub wake_words_detected: u64,
    pub callback_failures: u64,
}

/// Which handles the current run holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub engine_loaded: bool,
    pub device_open: bool,
    pub stream_open: bool,
}

type DetectionCallback = dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync;

/// Handles owned by one run
#[derive(Default)]
struct Resources {
    engine: Option<Box<dyn WakeEngine>>,
    device: Option<Box<dyn AudioDevice>>,
    stream: Option<Box<dyn AudioStream>>,
}

impl Resources {
    fn status(&self) -> ResourceStatus {
        ResourceStatus {
            engine_loaded: self.engine.is_some(),
            device_open: self.device.is_some(),
            stream_open: self.stream.is_some(),
        }
    }

    /// Release every handle still held. Each release is attempted even if
    /// an earlier one failed.
    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if stream.is_active() {
                if let Err(e) = stream.stop() {
                    error!("Failed to stop audio stream: {}", e);
                }
            }
            if let Err(e) = stream.close() {
                error!("Failed to close audio stream: {}", e);
            }
            debug!("Audio stream released");
        }

        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.terminate() {
                error!("Failed to terminate audio device: {}", e);
            }
            debug!("Audio device released");
        }

        if self.engine.take().is_some() {
            debug!("Wake-word engine released");
        }
    }
}

/// Flags and handles of one run. A new run never reuses these, so a worker
/// left over from an earlier run cannot be revived.
struct Run {
    running: AtomicBool,
    paused: AtomicBool,
    resources: Mutex<Resources>,
}

impl Run {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            resources: Mutex::new(Resources::default()),
        }
    }
}

/// State shared between the controller and its workers
struct Shared {
    state: Mutex<ControllerState>,
    callbacks: RwLock<Vec<Arc<DetectionCallback>>>,
    runs_started: AtomicU64,
    frames_processed: AtomicU64,
    wake_words_detected: AtomicU64,
    callback_failures: AtomicU64,
}

/// Controller-side handle on a spawned worker
struct Worker {
    run: Arc<Run>,
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

impl Worker {
    /// Wait for the worker to exit; hands the worker back on timeout
    fn join_timeout(self, timeout: Duration) -> Result<(), Worker> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    error!("Detection worker panicked");
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }

    fn is_current_thread(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }
}

/// Everything the worker thread needs for one run
struct WorkerContext {
    run: Arc<Run>,
    shared: Arc<Shared>,
    engine: Arc<dyn EngineFactory>,
    audio: Arc<dyn AudioBackend>,
    model_paths: Arc<[String]>,
    sensitivity: String,
    params: StreamParams,
    pause_poll: Duration,
    span: Span,
    _done_tx: Sender<()>,
}

/// Background wake-word detection controller
pub struct DetectionController {
    model_paths: Arc<[String]>,
    sensitivities: Vec<f32>,
    params: StreamParams,
    join_timeout: Duration,
    pause_poll: Duration,
    engine: Option<Arc<dyn EngineFactory>>,
    audio: Arc<dyn AudioBackend>,
    enabled: bool,
    span: Span,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DetectionController {
    /// Create a controller. Opens nothing and spawns nothing.
    ///
    /// `engine` is `None` when no wake-word engine is available; the
    /// controller is then disabled and `start` reports failure.
    pub fn new(
        settings: DetectorSettings,
        engine: Option<Arc<dyn EngineFactory>>,
        audio: Arc<dyn AudioBackend>,
    ) -> Result<Self, ControllerError> {
        if settings.sample_rate == 0 || settings.frame_size == 0 || settings.channels == 0 {
            return Err(ControllerError::InvalidConfig(
                "sample_rate, frame_size and channels must be positive".to_string(),
            ));
        }

        let sensitivities = settings.sensitivity.resolve(settings.model_paths.len())?;
        let enabled = engine.is_some() && !settings.model_paths.is_empty();

        let span = info_span!("wakeword", models = settings.model_paths.len());
        span.in_scope(|| {
            info!("Initializing wake-word controller");
            info!("Models: {:?}", settings.model_paths);
            info!("Sensitivities: {:?}", sensitivities);
            if !enabled {
                warn!(
                    engine_available = engine.is_some(),
                    "Wake-word detection disabled (no engine or no model paths)"
                );
            }
        });

        Ok(Self {
            model_paths: settings.model_paths.into(),
            sensitivities,
            params: StreamParams::pcm16(settings.channels, settings.sample_rate, settings.frame_size),
            join_timeout: settings.join_timeout,
            pause_poll: settings.pause_poll,
            engine,
            audio,
            enabled,
            span,
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState::Idle),
                callbacks: RwLock::new(Vec::new()),
                runs_started: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                wake_words_detected: AtomicU64::new(0),
                callback_failures: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Record all controller and worker logging in `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Start detection on a new worker. Returns false if detection is disabled
    /// or the worker could not be spawned.
    pub fn start(&self) -> bool {
        let _enter = self.span.enter();

        let Some(engine) = self.engine.as_ref().filter(|_| self.enabled) else {
            warn!("Wake-word detection is not enabled or has no models configured");
            return false;
        };

        let mut worker = self.worker.lock();
        let mut state = self.shared.state.lock();

        if matches!(*state, ControllerState::Running | ControllerState::Paused) {
            info!("Wake-word detection already running");
            return true;
        }

        // Reap the worker of a previous run before spawning another
        if let Some(previous) = worker.take() {
            drop(state);
            match previous.join_timeout(self.join_timeout) {
                Ok(()) => debug!("Previous detection worker reaped"),
                Err(previous) => {
                    error!("Previous detection worker is still alive; not starting a second one");
                    *worker = Some(previous);
                    return false;
                }
            }
            state = self.shared.state.lock();
        }

        let run = Arc::new(Run::new());
        let (done_tx, done_rx) = bounded::<()>(0);

        let context = WorkerContext {
            run: Arc::clone(&run),
            shared: Arc::clone(&self.shared),
            engine: Arc::clone(engine),
            audio: Arc::clone(&self.audio),
            model_paths: Arc::clone(&self.model_paths),
            sensitivity: format_sensitivities(&self.sensitivities),
            params: self.params.clone(),
            pause_poll: self.pause_poll,
            span: self.span.clone(),
            _done_tx: done_tx,
        };

        let handle = match thread::Builder::new()
            .name("wakeword-detector".to_string())
            .spawn(move || context.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn detection worker: {}", e);
                return false;
            }
        };

        *state = ControllerState::Running;
        *worker = Some(Worker { run, handle, done_rx });
        self.shared.runs_started.fetch_add(1, Ordering::Relaxed);

        info!("Wake-word detection started");
        true
    }

    /// Stop detection and release every resource. Safe to call in any state,
    /// any number of times.
    pub fn stop(&self) {
        let _enter = self.span.enter();
        let mut slot = self.worker.lock();

        if let Some(worker) = slot.take() {
            worker.run.running.store(false, Ordering::Release);
            worker.run.paused.store(false, Ordering::Release);
            let run = Arc::clone(&worker.run);

            if worker.is_current_thread() {
                // Called from a detection callback: the worker tears itself
                // down once the callbacks return
                debug!("Stop requested from the detection worker");
                *slot = Some(worker);
            } else {
                if let Err(stuck) = worker.join_timeout(self.join_timeout) {
                    warn!(
                        "Detection worker did not exit within {:?}; releasing resources anyway",
                        self.join_timeout
                    );
                    *slot = Some(stuck);
                }

                let resources = run.resources.try_lock_for(self.join_timeout);
                match resources {
                    Some(mut resources) => resources.release(),
                    None => error!("Audio resources still held by a stuck detection worker"),
                }
            }
        }

        *self.shared.state.lock() = ControllerState::Stopped;
        info!("Wake-word detection stopped");
    }

    /// Suspend detection without releasing the audio stream or engine
    pub fn pause(&self) {
        let _enter = self.span.enter();
        let worker = self.worker.lock();
        let mut state = self.shared.state.lock();

        match (&*worker, *state) {
            (Some(worker), ControllerState::Running) => {
                worker.run.paused.store(true, Ordering::Release);
                *state = ControllerState::Paused;
                info!("Wake-word detection paused");
            }
            (_, current) => debug!("Pause ignored in state {:?}", current),
        }
    }

    /// Resume a paused run
    pub fn resume(&self) {
        let _enter = self.span.enter();
        let worker = self.worker.lock();
        let mut state = self.shared.state.lock();

        match (&*worker, *state) {
            (Some(worker), ControllerState::Paused) => {
                worker.run.paused.store(false, Ordering::Release);
                *state = ControllerState::Running;
                info!("Wake-word detection resumed");
            }
            (_, current) => debug!("Resume ignored in state {:?}", current),
        }
    }

    /// True only while actively listening (false when paused)
    pub fn is_running(&self) -> bool {
        *self.shared.state.lock() == ControllerState::Running
    }

    pub fn state(&self) -> ControllerState {
        *self.shared.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn model_paths(&self) -> &[String] {
        &self.model_paths
    }

    pub fn sensitivities(&self) -> &[f32] {
        &self.sensitivities
    }

    /// Register a callback for every detection, called with the matched
    /// model path and a human-readable label. Callbacks run on the worker
    /// thread in registration order; an error or panic in one is logged and
    /// does not affect the others.
    pub fn on_detected<F>(&self, callback: F)
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.callbacks.write().push(Arc::new(callback));
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            runs_started: self.shared.runs_started.load(Ordering::Relaxed),
            frames_processed: self.shared.frames_processed.load(Ordering::Relaxed),
            wake_words_detected: self.shared.wake_words_detected.load(Ordering::Relaxed),
            callback_failures: self.shared.callback_failures.load(Ordering::Relaxed),
        }
    }

    /// Handles held by the current run. May wait for an in-flight frame read.
    pub fn resource_status(&self) -> ResourceStatus {
        let worker = self.worker.lock();
        match &*worker {
            Some(worker) => worker
                .run
                .resources
                .try_lock_for(self.join_timeout)
                .map(|resources| resources.status())
                .unwrap_or_default(),
            None => ResourceStatus::default(),
        }
    }
}

impl Drop for DetectionController {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.stop();
        }
    }
}

impl WorkerContext {
    fn run(self) {
        let span = self.span.clone();
        let _enter = span.enter();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.acquire()?;
            self.detection_loop()
        }));

        match outcome {
            Ok(Ok(())) => debug!("Detection loop exited"),
            Ok(Err(e)) => error!("Detection loop failed: {}", e),
            Err(payload) => error!("{}", ControllerError::WorkerPanicked(panic_message(&*payload))),
        }

        self.run.resources.lock().release();
        self.run.running.store(false, Ordering::Release);
        *self.shared.state.lock() = ControllerState::Stopped;
        info!("Detection worker exited");
    }

    /// Build the engine, then open the device and stream. Each handle is
    /// stored as soon as it exists so teardown sees partial setups.
    fn acquire(&self) -> Result<(), ControllerError> {
        let engine = self.engine.create(&self.model_paths, &self.sensitivity)?;
        self.run.resources.lock().engine = Some(engine);

        let mut device = self.audio.open_device()?;
        let stream = device.open_stream(&self.params);

        let mut resources = self.run.resources.lock();
        resources.device = Some(device);
        resources.stream = Some(stream?);

        info!(
            sample_rate = self.params.sample_rate,
            frame_size = self.params.frame_size,
            "Listening for wake words"
        );
        Ok(())
    }

    fn detection_loop(&self) -> Result<(), ControllerError> {
        let frame_size = self.params.frame_size;
        let mut was_paused = false;

        while self.run.running.load(Ordering::Acquire) {
            if self.run.paused.load(Ordering::Acquire) {
                was_paused = true;
                thread::sleep(self.pause_poll);
                continue;
            }

            if was_paused {
                // Audio captured during the pause is never fed to the engine
                was_paused = false;
                if let Some(stream) = self.run.resources.lock().stream.as_mut() {
                    stream.discard_buffered();
                }
                debug!("Discarded input buffered while paused");
            }

            let detected = {
                let mut resources = self.run.resources.lock();
                let Resources {
                    engine: Some(engine),
                    stream: Some(stream),
                    ..
                } = &mut *resources
                else {
                    // Released by `stop`, which clears the run flag first
                    break;
                };

                let frame = stream.read(frame_size)?;
                self.shared.frames_processed.fetch_add(1, Ordering::Relaxed);
                engine.run_detection(&frame)?
            };

            let Some(index) = detected else {
                continue;
            };

            if index < self.model_paths.len() {
                info!(index, model = %self.model_paths[index], "Wake word detected");
                self.shared.wake_words_detected.fetch_add(1, Ordering::Relaxed);
                self.trigger_callbacks(index);
            } else {
                warn!("Engine reported unknown model index {}", index);
            }

            if let Some(engine) = self.run.resources.lock().engine.as_mut() {
                engine.reset();
            }
        }

        Ok(())
    }

    fn trigger_callbacks(&self, index: usize) {
        let model_path = self.model_paths[index].as_str();
        let label = format!("wake word index: {}", index);

        // Snapshot so callbacks may register further callbacks
        let callbacks: Vec<Arc<DetectionCallback>> = self.shared.callbacks.read().clone();

        for (position, callback) in callbacks.iter().enumerate() {
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| callback(model_path, &label))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panicked: {}", panic_message(&*payload)),
            };

            self.shared.callback_failures.fetch_add(1, Ordering::Relaxed);
            error!(callback = position, "Detection callback failed: {}", failure);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSample;
    use crate::engine::{MockEngineFactory, MockWakeEngine};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(3);

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Call counters shared by the fake audio backend and its handles
    #[derive(Default)]
    struct AudioProbe {
        devices_opened: AtomicUsize,
        streams_opened: AtomicUsize,
        reads: AtomicUsize,
        stream_stops: AtomicUsize,
        stream_closes: AtomicUsize,
        terminates: AtomicUsize,
        discards: AtomicUsize,
        fail_read_at: Mutex<Option<usize>>,
        fail_open_stream: AtomicBool,
        fail_close: AtomicBool,
        block_reads: AtomicBool,
    }

    struct FakeAudio {
        probe: Arc<AudioProbe>,
    }

    impl AudioBackend for FakeAudio {
        fn open_device(&self) -> Result<Box<dyn AudioDevice>, AudioError> {
            self.probe.devices_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDevice {
                probe: Arc::clone(&self.probe),
            }))
        }
    }

    struct FakeDevice {
        probe: Arc<AudioProbe>,
    }

    impl AudioDevice for FakeDevice {
        fn open_stream(&mut self, params: &StreamParams) -> Result<Box<dyn AudioStream>, AudioError> {
            if self.probe.fail_open_stream.load(Ordering::SeqCst) {
                return Err(AudioError::StreamBuild("device busy".to_string()));
            }
            assert_eq!(params.format, crate::audio::SampleFormat::I16);
            self.probe.streams_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                probe: Arc::clone(&self.probe),
                active: true,
            }))
        }

        fn terminate(&mut self) -> Result<(), AudioError> {
            self.probe.terminates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeStream {
        probe: Arc<AudioProbe>,
        active: bool,
    }

    impl AudioStream for FakeStream {
        fn read(&mut self, frame_size: usize) -> Result<Vec<AudioSample>, AudioError> {
            while self.probe.block_reads.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            thread::sleep(Duration::from_millis(2));

            let count = self.probe.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if *self.probe.fail_read_at.lock() == Some(count) {
                return Err(AudioError::Stream("device unplugged".to_string()));
            }
            Ok(vec![0; frame_size])
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            self.active = false;
            self.probe.stream_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<(), AudioError> {
            self.probe.stream_closes.fetch_add(1, Ordering::SeqCst);
            if self.probe.fail_close.load(Ordering::SeqCst) {
                return Err(AudioError::Stream("close failed".to_string()));
            }
            Ok(())
        }

        fn discard_buffered(&mut self) {
            self.probe.discards.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Engine that reports a match on chosen frame numbers
    struct ScriptedEngine {
        frames: usize,
        hits: Vec<(usize, usize)>,
        resets: Arc<AtomicUsize>,
    }

    impl WakeEngine for ScriptedEngine {
        fn run_detection(&mut self, _frame: &[AudioSample]) -> Result<Option<usize>, EngineError> {
            self.frames += 1;
            Ok(self
                .hits
                .iter()
                .find(|(frame, _)| *frame == self.frames)
                .map(|(_, index)| *index))
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        hits: Vec<(usize, usize)>,
        created: AtomicUsize,
        resets: Arc<AtomicUsize>,
        sensitivity_seen: Mutex<Option<String>>,
    }

    impl ScriptedFactory {
        fn new(hits: Vec<(usize, usize)>) -> Arc<Self> {
            Arc::new(Self {
                hits,
                created: AtomicUsize::new(0),
                resets: Arc::new(AtomicUsize::new(0)),
                sensitivity_seen: Mutex::new(None),
            })
        }
    }

    impl EngineFactory for ScriptedFactory {
        fn create(&self, _model_paths: &[String], sensitivity: &str) -> Result<Box<dyn WakeEngine>, EngineError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            *self.sensitivity_seen.lock() = Some(sensitivity.to_string());
            Ok(Box::new(ScriptedEngine {
                frames: 0,
                hits: self.hits.clone(),
                resets: Arc::clone(&self.resets),
            }))
        }
    }

    fn settings(models: usize) -> DetectorSettings {
        DetectorSettings {
            model_paths: (0..models).map(|i| format!("models/wake_{}.pmdl", i)).collect(),
            frame_size: 160,
            join_timeout: Duration::from_millis(500),
            pause_poll: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn controller(
        models: usize,
        factory: Arc<ScriptedFactory>,
    ) -> (DetectionController, Arc<AudioProbe>) {
        let probe = Arc::new(AudioProbe::default());
        let audio = Arc::new(FakeAudio {
            probe: Arc::clone(&probe),
        });
        let factory: Arc<dyn EngineFactory> = factory;
        let controller = DetectionController::new(settings(models), Some(factory), audio).unwrap();
        (controller, probe)
    }

    #[test]
    fn test_controller_creation() {
        let (controller, probe) = controller(2, ScriptedFactory::new(vec![]));

        assert!(controller.is_enabled());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(!controller.is_running());
        assert_eq!(controller.sensitivities().to_vec(), vec![0.5f32, 0.5]);
        assert_eq!(controller.resource_status(), ResourceStatus::default());
        assert_eq!(probe.devices_opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sensitivity_list_length_must_match() {
        let mut settings = settings(2);
        settings.sensitivity = Sensitivity::PerModel(vec![0.4]);
        let audio = Arc::new(FakeAudio {
            probe: Arc::new(AudioProbe::default()),
        });

        let factory: Arc<dyn EngineFactory> = ScriptedFactory::new(vec![]);
        let result = DetectionController::new(settings, Some(factory), audio);
        assert!(matches!(
            result,
            Err(ControllerError::SensitivityMismatch {
                models: 2,
                sensitivities: 1
            })
        ));
    }

    #[test]
    fn test_sensitivity_out_of_range_rejected() {
        assert!(Sensitivity::Uniform(1.5).resolve(1).is_err());
        assert!(Sensitivity::PerModel(vec![0.2, -0.1]).resolve(2).is_err());
        assert_eq!(Sensitivity::Uniform(0.3).resolve(3).unwrap(), vec![0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_zero_frame_size_rejected() {
        let mut settings = settings(1);
        settings.frame_size = 0;
        let audio = Arc::new(FakeAudio {
            probe: Arc::new(AudioProbe::default()),
        });

        let factory: Arc<dyn EngineFactory> = ScriptedFactory::new(vec![]);
        let result = DetectionController::new(settings, Some(factory), audio);
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_no_models_disables_start() {
        let factory = ScriptedFactory::new(vec![]);
        let (controller, probe) = controller(0, Arc::clone(&factory));

        assert!(!controller.is_enabled());
        assert!(!controller.start());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(probe.devices_opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_engine_disables_start() {
        let probe = Arc::new(AudioProbe::default());
        let audio = Arc::new(FakeAudio {
            probe: Arc::clone(&probe),
        });
        let controller = DetectionController::new(settings(1), None, audio).unwrap();

        assert!(!controller.is_enabled());
        assert!(!controller.start());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(probe.devices_opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_runs_and_is_idempotent() {
        let factory = ScriptedFactory::new(vec![]);
        let (controller, probe) = controller(1, Arc::clone(&factory));

        assert!(controller.start());
        assert!(controller.is_running());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));

        assert!(controller.start());
        controller.pause();
        assert!(controller.start());

        assert_eq!(controller.stats().runs_started, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(probe.streams_opened.load(Ordering::SeqCst), 1);
        assert_eq!(factory.sensitivity_seen.lock().as_deref(), Some("0.5"));

        controller.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));

        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));

        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.resource_status(), ResourceStatus::default());
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);

        // No reads after stop returns
        let reads = probe.reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.reads.load(Ordering::SeqCst), reads);
    }

    #[test]
    fn test_restart_after_stop() {
        let factory = ScriptedFactory::new(vec![]);
        let (controller, probe) = controller(1, Arc::clone(&factory));

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));
        controller.stop();

        assert!(controller.start());
        assert!(controller.is_running());
        assert!(wait_for(|| probe.streams_opened.load(Ordering::SeqCst) == 2));
        controller.stop();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 2);
        assert_eq!(controller.stats().runs_started, 2);
    }

    #[test]
    fn test_pause_keeps_resources_and_stops_reads() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));

        assert!(controller.start());
        assert!(wait_for(|| controller.resource_status().stream_open));
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 2));

        controller.pause();
        assert_eq!(controller.state(), ControllerState::Paused);
        assert!(!controller.is_running());

        // Let an in-flight read finish, then reads must stay flat
        thread::sleep(Duration::from_millis(30));
        let reads = probe.reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(probe.reads.load(Ordering::SeqCst), reads);

        let status = controller.resource_status();
        assert!(status.engine_loaded && status.device_open && status.stream_open);

        controller.resume();
        assert!(controller.is_running());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > reads));

        // Same handles: nothing reopened or released
        assert_eq!(probe.devices_opened.load(Ordering::SeqCst), 1);
        assert_eq!(probe.streams_opened.load(Ordering::SeqCst), 1);
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 0);

        controller.stop();
    }

    #[test]
    fn test_resume_discards_input_buffered_while_paused() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));
        assert_eq!(probe.discards.load(Ordering::SeqCst), 0);

        for round in 1..=2 {
            controller.pause();
            thread::sleep(Duration::from_millis(40));
            assert_eq!(probe.discards.load(Ordering::SeqCst), round - 1);

            controller.resume();
            assert!(wait_for(|| probe.discards.load(Ordering::SeqCst) == round));

            let reads = probe.reads.load(Ordering::SeqCst);
            assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > reads));
        }

        controller.stop();
        assert_eq!(probe.discards.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pause_and_resume_outside_applicable_state() {
        let (controller, _probe) = controller(1, ScriptedFactory::new(vec![]));

        controller.pause();
        assert_eq!(controller.state(), ControllerState::Idle);
        controller.resume();
        assert_eq!(controller.state(), ControllerState::Idle);

        assert!(controller.start());
        controller.resume();
        assert_eq!(controller.state(), ControllerState::Running);

        controller.stop();
        controller.pause();
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[test]
    fn test_callbacks_fire_in_order_and_are_isolated() {
        let factory = ScriptedFactory::new(vec![(3, 1)]);
        let (controller, probe) = controller(2, Arc::clone(&factory));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&calls);
        controller.on_detected(move |path, label| {
            log.lock().push(("first", path.to_string(), label.to_string()));
            anyhow::bail!("subscriber offline")
        });
        let log = Arc::clone(&calls);
        controller.on_detected(move |path, label| {
            log.lock().push(("second", path.to_string(), label.to_string()));
            panic!("subscriber bug");
        });
        let log = Arc::clone(&calls);
        controller.on_detected(move |path, label| {
            log.lock().push(("third", path.to_string(), label.to_string()));
            Ok(())
        });

        assert!(controller.start());
        assert!(wait_for(|| calls.lock().len() == 3));

        // Worker survives failing callbacks
        let reads = probe.reads.load(Ordering::SeqCst);
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > reads + 2));
        assert!(controller.is_running());

        let calls = calls.lock().clone();
        let order: Vec<&str> = calls.iter().map(|(name, _, _)| *name).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        for (_, path, label) in &calls {
            assert_eq!(path, "models/wake_1.pmdl");
            assert!(label.contains('1'));
        }

        let stats = controller.stats();
        assert_eq!(stats.wake_words_detected, 1);
        assert_eq!(stats.callback_failures, 2);
        assert_eq!(factory.resets.load(Ordering::SeqCst), 1);

        controller.stop();
    }

    #[test]
    fn test_each_detection_reaches_every_callback() {
        let factory = ScriptedFactory::new(vec![(2, 0), (4, 1), (6, 0)]);
        let (controller, _probe) = controller(2, Arc::clone(&factory));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let seen = Arc::clone(&seen);
            controller.on_detected(move |path, _| {
                seen.lock().push(format!("{}:{}", name, path));
                Ok(())
            });
        }

        assert!(controller.start());
        assert!(wait_for(|| seen.lock().len() == 6));
        controller.stop();

        assert_eq!(
            *seen.lock(),
            vec![
                "a:models/wake_0.pmdl",
                "b:models/wake_0.pmdl",
                "a:models/wake_1.pmdl",
                "b:models/wake_1.pmdl",
                "a:models/wake_0.pmdl",
                "b:models/wake_0.pmdl",
            ]
        );
        assert_eq!(factory.resets.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fatal_read_error_tears_down_once() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));
        *probe.fail_read_at.lock() = Some(5);

        assert!(controller.start());
        assert!(wait_for(|| !controller.is_running()));
        assert!(wait_for(|| controller.state() == ControllerState::Stopped));

        assert_eq!(probe.stream_stops.load(Ordering::SeqCst), 1);
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(probe.reads.load(Ordering::SeqCst), 5);

        // A later stop finds nothing left to release
        controller.stop();
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(controller.resource_status(), ResourceStatus::default());
    }

    #[test]
    fn test_start_retries_after_failed_run() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));
        probe.fail_open_stream.store(true, Ordering::SeqCst);

        assert!(controller.start());
        assert!(wait_for(|| controller.state() == ControllerState::Stopped));
        // Device opened before the stream failed is still terminated
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);

        probe.fail_open_stream.store(false, Ordering::SeqCst);
        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));
        assert!(controller.is_running());

        controller.stop();
    }

    #[test]
    fn test_teardown_failure_does_not_skip_device() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));
        probe.fail_close.store(true, Ordering::SeqCst);

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));
        controller.stop();

        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[test]
    fn test_stop_from_callback() {
        let factory = ScriptedFactory::new(vec![(2, 0)]);
        let (controller, probe) = controller(1, factory);
        let controller = Arc::new(controller);

        let weak = Arc::downgrade(&controller);
        let stopped_once = AtomicBool::new(false);
        let held_after_stop = Arc::new(Mutex::new(None));
        let held = Arc::clone(&held_after_stop);
        let callback_probe = Arc::clone(&probe);
        controller.on_detected(move |_, _| {
            if !stopped_once.swap(true, Ordering::SeqCst) {
                if let Some(controller) = weak.upgrade() {
                    controller.stop();
                    // Only signalled: nothing released on the worker thread yet
                    *held.lock() = Some((
                        controller.resource_status(),
                        callback_probe.stream_closes.load(Ordering::SeqCst),
                    ));
                }
            }
            Ok(())
        });

        assert!(controller.start());
        assert!(wait_for(|| held_after_stop.lock().is_some()));
        let (status, closes) = held_after_stop.lock().take().unwrap();
        assert!(status.engine_loaded && status.device_open && status.stream_open);
        assert_eq!(closes, 0);

        assert!(wait_for(|| controller.state() == ControllerState::Stopped));
        assert!(wait_for(|| probe.terminates.load(Ordering::SeqCst) == 1));
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);

        // The finished worker is reaped by the next start
        assert!(controller.start());
        assert!(controller.is_running());
        controller.stop();
    }

    #[test]
    fn test_stop_is_bounded_when_worker_is_stuck() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));
        probe.block_reads.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        controller.stop();
        // join timeout + resource lock timeout
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(controller.state(), ControllerState::Stopped);

        // The stuck worker blocks a second one
        assert!(!controller.start());

        probe.block_reads.store(false, Ordering::SeqCst);
        assert!(wait_for(|| probe.terminates.load(Ordering::SeqCst) == 1));

        assert!(controller.start());
        assert!(controller.is_running());
        controller.stop();
    }

    #[test]
    fn test_engine_construction_failure_skips_audio() {
        let mut factory = MockEngineFactory::new();
        factory
            .expect_create()
            .withf(|paths: &[String], sensitivity: &str| paths.len() == 2 && sensitivity == "0.4,0.6")
            .times(1)
            .returning(|_, _| Err(EngineError::Init("corrupt model".to_string())));

        let probe = Arc::new(AudioProbe::default());
        let audio = Arc::new(FakeAudio {
            probe: Arc::clone(&probe),
        });
        let mut settings = settings(2);
        settings.sensitivity = Sensitivity::PerModel(vec![0.4, 0.6]);

        let factory: Arc<dyn EngineFactory> = Arc::new(factory);
        let controller = DetectionController::new(settings, Some(factory), audio).unwrap();
        assert!(controller.start());
        assert!(wait_for(|| controller.state() == ControllerState::Stopped));

        assert_eq!(probe.devices_opened.load(Ordering::SeqCst), 0);
        assert_eq!(controller.resource_status(), ResourceStatus::default());
    }

    #[test]
    fn test_inference_error_is_fatal() {
        let mut factory = MockEngineFactory::new();
        factory.expect_create().times(1).returning(|_, _| {
            let mut engine = MockWakeEngine::new();
            let mut calls = 0;
            engine.expect_run_detection().returning(move |_| {
                calls += 1;
                if calls < 3 {
                    Ok(None)
                } else {
                    Err(EngineError::Detection("inference failed".to_string()))
                }
            });
            engine.expect_reset().never();
            Ok(Box::new(engine) as Box<dyn WakeEngine>)
        });

        let probe = Arc::new(AudioProbe::default());
        let audio = Arc::new(FakeAudio {
            probe: Arc::clone(&probe),
        });
        let factory: Arc<dyn EngineFactory> = Arc::new(factory);
        let controller = DetectionController::new(settings(1), Some(factory), audio).unwrap();

        assert!(controller.start());
        assert!(wait_for(|| controller.state() == ControllerState::Stopped));
        assert_eq!(probe.reads.load(Ordering::SeqCst), 3);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(controller.stats().frames_processed, 3);
    }

    #[test]
    fn test_unknown_index_is_ignored() {
        let factory = ScriptedFactory::new(vec![(2, 7)]);
        let (controller, probe) = controller(1, Arc::clone(&factory));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        controller.on_detected(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 4));
        assert!(controller.is_running());
        controller.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(factory.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_stops_worker() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));
        assert!(controller.start());
        assert!(wait_for(|| probe.reads.load(Ordering::SeqCst) > 0));

        drop(controller);
        assert_eq!(probe.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(probe.stream_closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_control_calls() {
        let (controller, probe) = controller(1, ScriptedFactory::new(vec![]));
        let controller = Arc::new(controller);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    for _ in 0..20 {
                        match i % 4 {
                            0 => {
                                controller.start();
                            }
                            1 => controller.pause(),
                            2 => controller.resume(),
                            _ => {
                                controller.is_running();
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.stats().runs_started, 1);
        assert_eq!(
            probe.streams_opened.load(Ordering::SeqCst),
            probe.stream_closes.load(Ordering::SeqCst)
        );
    }
}
