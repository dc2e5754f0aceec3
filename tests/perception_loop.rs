//! Perception loop integration tests with scripted adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;

use scene_narrator::camera::{Frame, FrameSource};
use scene_narrator::config::OverlayConfig;
use scene_narrator::detector::{Detection, DetectionAdapter, Region};
use scene_narrator::error::{CameraError, ModelError, NarrationError, OcrError};
use scene_narrator::narration::SpeechParams;
use scene_narrator::ocr::TextRecognitionAdapter;
use scene_narrator::overlay::OverlayRenderer;
use scene_narrator::service::{Command, LoopTiming, Mode, PerceptionLoop};
use scene_narrator::status::StatusHandle;
use scene_narrator::status::StatusSurface;
use scene_narrator::summarizer::Summarizer;
use scene_narrator::tts::{NarrationSink, VoiceProfile};

// --- Scripted collaborators ---

struct TestCamera;

impl FrameSource for TestCamera {
    fn acquire(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        Ok(Frame {
            image: image::RgbImage::new(32, 32),
        })
    }
}

/// Returns the scripted batches in order, repeating the last one.
struct ScriptedDetector {
    batches: Vec<Vec<Detection>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DetectionAdapter for ScriptedDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches[i.min(self.batches.len() - 1)].clone())
    }
}

/// Fails on the first call, then produces a fixed batch.
struct FlakyDetector {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DetectionAdapter for FlakyDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        if i == 0 {
            Err(ModelError::Inference("synthetic failure".into()))
        } else {
            Ok(vec![det("cat", 0.9)])
        }
    }
}

struct ScriptedOcr {
    text: String,
}

#[async_trait]
impl TextRecognitionAdapter for ScriptedOcr {
    async fn recognize(&self, _frame: &Frame) -> Result<String, OcrError> {
        Ok(self.text.clone())
    }
}

/// Records spoken text instead of producing audio.
struct RecordingSink {
    spoken: Arc<Mutex<Vec<String>>>,
    catalog_tx: watch::Sender<Vec<VoiceProfile>>,
}

impl RecordingSink {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (catalog_tx, _) = watch::channel(Vec::new());
        (
            Self {
                spoken: Arc::clone(&spoken),
                catalog_tx,
            },
            spoken,
        )
    }
}

#[async_trait]
impl NarrationSink for RecordingSink {
    async fn speak(&self, text: &str, _params: &SpeechParams) -> Result<(), NarrationError> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn voices(&self) -> Vec<VoiceProfile> {
        Vec::new()
    }

    fn subscribe_voices(&self) -> watch::Receiver<Vec<VoiceProfile>> {
        self.catalog_tx.subscribe()
    }

    fn refresh_voices(&self) -> Result<(), NarrationError> {
        Ok(())
    }
}

// --- Harness ---

fn det(label: &str, confidence: f32) -> Detection {
    Detection {
        label: label.to_string(),
        confidence,
        region: Region {
            x: 1.0,
            y: 1.0,
            width: 10.0,
            height: 10.0,
        },
    }
}

struct Harness {
    commands: mpsc::Sender<Command>,
    status: StatusHandle,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

fn start_loop(
    detector: Arc<dyn DetectionAdapter>,
    ocr_text: &str,
    initial_mode: Mode,
    period_ms: u64,
) -> Harness {
    let camera: Arc<Mutex<Box<dyn FrameSource>>> = Arc::new(Mutex::new(Box::new(TestCamera)));
    let ocr = Arc::new(ScriptedOcr {
        text: ocr_text.to_string(),
    });
    let (sink, spoken) = RecordingSink::new();
    let overlay = Arc::new(OverlayRenderer::new(
        0.50,
        &OverlayConfig {
            enabled: false,
            preview_path: String::new(),
        },
    ));
    let settings = Arc::new(Mutex::new(SpeechParams {
        voice: "af_heart".into(),
        rate: 1.0,
    }));
    let status_surface = StatusSurface::new(false);
    let status = status_surface.handle();

    let (command_tx, command_rx) = mpsc::channel(16);
    let (model_tx, model_rx) = oneshot::channel();

    let service = PerceptionLoop::new(
        LoopTiming {
            period: Duration::from_millis(period_ms),
            defer: Duration::from_millis(1),
        },
        initial_mode,
        camera,
        ocr,
        Arc::new(sink),
        overlay,
        Summarizer::new(0.55),
        settings,
        status_surface,
        command_rx,
    );
    tokio::spawn(service.run(model_rx));
    let _ = model_tx.send(Ok(detector));

    Harness {
        commands: command_tx,
        status,
        spoken,
    }
}

fn scripted(batches: Vec<Vec<Detection>>) -> (Arc<dyn DetectionAdapter>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(ScriptedDetector {
            batches,
            calls: Arc::clone(&calls),
        }),
        calls,
    )
}

// --- Tests ---

#[tokio::test]
async fn unchanged_scene_is_narrated_once() {
    let (detector, calls) = scripted(vec![vec![det("cat", 0.9), det("dog", 0.7)]]);
    let harness = start_loop(detector, "", Mode::Scene, 50);

    sleep(Duration::from_millis(400)).await;

    assert!(calls.load(Ordering::SeqCst) >= 3, "expected several cycles");
    assert_eq!(harness.spoken(), vec!["I see a cat and a dog."]);
    assert_eq!(harness.status.current(), "I see cat, dog");
}

#[tokio::test]
async fn changed_scene_is_narrated_again() {
    let (detector, _) = scripted(vec![
        vec![det("cat", 0.9)],
        vec![det("dog", 0.9)],
        vec![det("dog", 0.9)],
    ]);
    let harness = start_loop(detector, "", Mode::Scene, 50);

    sleep(Duration::from_millis(400)).await;

    assert_eq!(
        harness.spoken(),
        vec!["I see a cat.".to_string(), "I see a dog.".to_string()]
    );
}

#[tokio::test]
async fn pause_stops_cycles_and_resume_restarts() {
    let (detector, calls) = scripted(vec![vec![det("cat", 0.9)]]);
    let harness = start_loop(detector, "", Mode::Scene, 50);

    sleep(Duration::from_millis(200)).await;
    harness.commands.send(Command::Pause).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let after_pause = calls.load(Ordering::SeqCst);
    assert!(after_pause >= 1);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        after_pause,
        "no cycles while paused"
    );

    harness.commands.send(Command::Resume).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(calls.load(Ordering::SeqCst) > after_pause, "cycles after resume");
}

#[tokio::test]
async fn mode_switch_takes_effect_on_next_cycle() {
    let (detector, _) = scripted(vec![vec![det("cat", 0.9)]]);
    let harness = start_loop(detector, "EXIT DOOR", Mode::Scene, 50);

    sleep(Duration::from_millis(150)).await;
    harness
        .commands
        .send(Command::SetMode(Mode::Text))
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;

    let spoken = harness.spoken();
    assert_eq!(spoken.first().map(String::as_str), Some("I see a cat."));
    assert!(spoken.contains(&"EXIT DOOR".to_string()), "spoken: {spoken:?}");
    assert_eq!(harness.status.current(), "Read: EXIT DOOR");
}

#[tokio::test]
async fn whitespace_ocr_apologizes_once() {
    let (detector, _) = scripted(vec![Vec::new()]);
    let harness = start_loop(detector, "   ", Mode::Text, 50);

    sleep(Duration::from_millis(400)).await;

    assert_eq!(
        harness.spoken(),
        vec!["Sorry, I could not find any text to read."]
    );
    assert_eq!(harness.status.current(), "No readable text found.");
}

#[tokio::test]
async fn manual_describe_runs_while_paused() {
    let (detector, calls) = scripted(vec![vec![det("cat", 0.9)], vec![det("dog", 0.9)]]);
    let harness = start_loop(detector, "", Mode::Scene, 60_000);

    // Only the immediate first cycle has run; the next tick is a minute out
    sleep(Duration::from_millis(150)).await;
    harness.commands.send(Command::Pause).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    harness.commands.send(Command::DescribeNow).await.unwrap();
    sleep(Duration::from_millis(150)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.spoken(),
        vec!["I see a cat.".to_string(), "I see a dog.".to_string()]
    );
    // Manual trigger does not resume automatic cycles
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn detector_failure_recovers_on_next_cycle() {
    let calls = Arc::new(AtomicUsize::new(0));
    let detector: Arc<dyn DetectionAdapter> = Arc::new(FlakyDetector {
        calls: Arc::clone(&calls),
    });
    let harness = start_loop(detector, "", Mode::Scene, 50);

    sleep(Duration::from_millis(300)).await;

    let spoken = harness.spoken();
    assert_eq!(
        spoken.first().map(String::as_str),
        Some("Sorry, something went wrong describing the scene.")
    );
    assert!(spoken.contains(&"I see a cat.".to_string()), "spoken: {spoken:?}");
    assert_eq!(harness.status.current(), "I see cat");
}

#[tokio::test]
async fn nothing_recognizable_scene_uses_fixed_pair() {
    let (detector, _) = scripted(vec![vec![det("chair", 0.3)]]);
    let harness = start_loop(detector, "", Mode::Scene, 50);

    sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.spoken(), vec!["I don't see anything I recognize."]);
    assert_eq!(harness.status.current(), "Nothing recognizable");
}
