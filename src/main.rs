/// Wake-word listener service binary
///
/// Runs the detection controller until Ctrl-C, or until the detection worker
/// stops on its own (device lost, end of a replayed WAV file).

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};
use wakeword_listener::{
    AudioBackend, AudioInput, ControllerState, CpalBackend, DetectionController, EnergyEngineFactory,
    EngineFactory, ListenerConfig, WavBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wakeword_listener=debug,wakeword_service=info")),
        )
        .init();

    info!("Starting wake-word listener service");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WAKEWORD_CONFIG").ok())
        .map(PathBuf::from);

    let config = ListenerConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let audio: Arc<dyn AudioBackend> = match &config.audio {
        AudioInput::Microphone { device } => Arc::new(CpalBackend::new(device.clone())),
        AudioInput::Wav { path, realtime } => Arc::new(WavBackend::new(path).realtime(*realtime)),
    };
    let engine: Arc<dyn EngineFactory> = Arc::new(EnergyEngineFactory::new(config.engine.hold_frames));

    let controller = DetectionController::new(config.detector_settings(), Some(engine), audio)
        .context("Failed to create detection controller")?
        .with_span(info_span!("wakeword", service = "wakeword-service"));
    let controller = Arc::new(controller);

    controller.on_detected(|model_path, label| {
        // In production: forward the event to the agent core
        info!("Wake word detected: model={} ({})", model_path, label);
        Ok(())
    });

    if !controller.start() {
        anyhow::bail!("Wake-word detection is disabled; configure at least one model path");
    }

    info!(
        "Wake-word listener running for {:?}. Press Ctrl-C to stop.",
        controller.model_paths()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut health = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = health.tick() => {
                if !controller.is_running() && controller.state() != ControllerState::Paused {
                    warn!("Detection worker stopped on its own, shutting down");
                    break;
                }
            }
        }
    }

    // Cleanup
    let stopping = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("Stop task failed")?;

    let stats = controller.stats();
    info!(
        "Wake-word listener stopped: {} frames, {} detections, {} callback failures",
        stats.frames_processed, stats.wake_words_detected, stats.callback_failures
    );

    Ok(())
}
