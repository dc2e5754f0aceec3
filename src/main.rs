//! scene-narrator-rs: assistive scene narration service for Linux.

use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scene_narrator::camera;
use scene_narrator::config::Config;
use scene_narrator::controls;
use scene_narrator::detector::{DetectionAdapter, OnnxDetector};
use scene_narrator::error::ModelError;
use scene_narrator::narration::SpeechParams;
use scene_narrator::ocr::TesseractOcr;
use scene_narrator::overlay::OverlayRenderer;
use scene_narrator::service::{Command, LoopTiming, Mode, PerceptionLoop};
use scene_narrator::status::StatusSurface;
use scene_narrator::summarizer::Summarizer;
use scene_narrator::tts::{KokoroSink, NarrationSink, NullSink};

#[derive(Parser, Debug)]
#[command(name = "scene-narrator-rs", about = "Assistive scene narration service")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Starting mode: scene or text
    #[arg(short, long, default_value = "scene")]
    mode: String,

    /// Run without speech output
    #[arg(long)]
    no_speech: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("scene-narrator-rs starting");

    let config = Config::load(args.config.as_deref());

    let initial_mode = if args.mode.eq_ignore_ascii_case("text") {
        Mode::Text
    } else {
        Mode::Scene
    };

    // Acquire the camera first; nothing can proceed without visual input
    let mut source = camera::open(&config.camera);
    if let Err(e) = source.acquire() {
        tracing::error!("Cannot start without camera: {e}");
        return Err(e.into());
    }
    let camera = Arc::new(Mutex::new(source));

    // Speech engine; failure degrades to silent operation
    let sink: Arc<dyn NarrationSink> = if args.no_speech || !config.narration.enabled {
        info!("Speech output disabled");
        Arc::new(NullSink::new())
    } else {
        // Loading blocks startup briefly, before any cycle can run
        match KokoroSink::load(&config.narration) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!("{e}");
                info!("Continuing without voice output");
                Arc::new(NullSink::new())
            }
        }
    };

    let settings = Arc::new(Mutex::new(SpeechParams {
        voice: config.narration.voice.clone(),
        rate: config.narration.rate,
    }));
    let status = StatusSurface::new(config.feedback.notifications);
    let overlay = Arc::new(OverlayRenderer::new(
        config.detection.overlay_confidence,
        &config.overlay,
    ));
    let summarizer = Summarizer::new(config.detection.speech_confidence);
    let ocr = Arc::new(TesseractOcr::new(config.ocr.clone()));

    // The detection model loads in the background; the camera surface is
    // live while it does, and the loop starts cycling once it resolves
    let (model_tx, model_rx) = tokio::sync::oneshot::channel();
    let detection_config = config.detection.clone();
    tokio::spawn(async move {
        let result =
            match tokio::task::spawn_blocking(move || OnnxDetector::load(&detection_config)).await
            {
                Ok(Ok(detector)) => Ok(Arc::new(detector) as Arc<dyn DetectionAdapter>),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ModelError::Load(format!("loader task: {e}"))),
            };
        let _ = model_tx.send(result);
    });

    let (command_tx, command_rx) = tokio::sync::mpsc::channel::<Command>(16);
    tokio::spawn(controls::read_stdin(command_tx));

    let timing = LoopTiming {
        period: std::time::Duration::from_secs_f64(config.detection.interval),
        defer: std::time::Duration::from_millis(config.narration.defer_ms),
    };

    let service = PerceptionLoop::new(
        timing,
        initial_mode,
        camera,
        ocr,
        sink,
        overlay,
        summarizer,
        settings,
        status,
        command_rx,
    );
    service.run(model_rx).await;

    Ok(())
}
