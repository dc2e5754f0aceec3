//! Perception loop orchestration with state machine.
//!
//! LOADING → READY(RUNNING | IDLE), with Scene/Text mode orthogonal in the
//! ready states. One select loop owns all orchestration state and drives:
//! user commands, the fixed-period scheduler, the in-flight cycle, model
//! readiness, and voice catalog changes.
//!
//! Overlap policy: skip-if-busy. A scheduler tick that fires while the
//! previous cycle is still in flight is skipped, which also keeps at most
//! one cycle logically in flight.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::camera::{Frame, FrameSource};
use crate::detector::DetectionAdapter;
use crate::error::{CameraError, ModelError};
use crate::narration::{NarrationGate, SpeechParams};
use crate::ocr::TextRecognitionAdapter;
use crate::overlay::OverlayRenderer;
use crate::status::StatusSurface;
use crate::summarizer::Summarizer;
use crate::tts::NarrationSink;

/// Active interpretation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Scene,
    Text,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scene => write!(f, "scene"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// User commands accepted by the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode(Mode),
    Pause,
    Resume,
    DescribeNow,
    SetVoice(String),
    SetRate(f32),
    RefreshVoices,
    Quit,
}

/// Run flags owned by the loop. The scheduler interval itself lives in
/// `run()`; it exists iff `running` is true.
#[derive(Debug, Clone, Copy)]
pub struct RunState {
    pub running: bool,
    pub mode: Mode,
}

/// Timing knobs: `period` between automatic cycle starts, `defer` between a
/// narration decision and the speak call.
#[derive(Debug, Clone)]
pub struct LoopTiming {
    pub period: Duration,
    pub defer: Duration,
}

pub type SharedCamera = Arc<Mutex<Box<dyn FrameSource>>>;

/// Result of one cycle, applied on the loop task.
struct CycleOutcome {
    mode: Mode,
    status: String,
    speech: Option<String>,
}

pub struct PerceptionLoop {
    camera: SharedCamera,
    detector: Option<Arc<dyn DetectionAdapter>>,
    ocr: Arc<dyn TextRecognitionAdapter>,
    sink: Arc<dyn NarrationSink>,
    overlay: Arc<OverlayRenderer>,
    summarizer: Summarizer,
    gate: NarrationGate,
    settings: Arc<Mutex<SpeechParams>>,
    status: StatusSurface,
    state: RunState,
    timing: LoopTiming,
    commands: mpsc::Receiver<Command>,
}

impl PerceptionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timing: LoopTiming,
        initial_mode: Mode,
        camera: SharedCamera,
        ocr: Arc<dyn TextRecognitionAdapter>,
        sink: Arc<dyn NarrationSink>,
        overlay: Arc<OverlayRenderer>,
        summarizer: Summarizer,
        settings: Arc<Mutex<SpeechParams>>,
        status: StatusSurface,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            camera,
            detector: None,
            ocr,
            sink,
            overlay,
            summarizer,
            gate: NarrationGate::new(),
            settings,
            status,
            state: RunState {
                running: false,
                mode: initial_mode,
            },
            timing,
            commands,
        }
    }

    /// Drive the loop until the command channel closes or a quit command
    /// arrives. `model_rx` resolves when the background model load finishes;
    /// no cycle of either mode runs before that.
    pub async fn run(
        mut self,
        model_rx: oneshot::Receiver<Result<Arc<dyn DetectionAdapter>, ModelError>>,
    ) {
        self.status.update("Camera ready, loading detection model...");

        let mut scheduler: Option<Interval> = None;
        let mut inflight: Option<JoinHandle<CycleOutcome>> = None;
        let mut model_rx = Some(model_rx);
        let mut voices_rx = self.sink.subscribe_voices();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("Command channel closed");
                        break;
                    };
                    if !self.handle_command(cmd, &mut scheduler, &mut inflight) {
                        break;
                    }
                }

                res = async { model_rx.as_mut().unwrap().await }, if model_rx.is_some() => {
                    model_rx = None;
                    match res {
                        Ok(Ok(detector)) => {
                            self.detector = Some(detector);
                            self.state.running = true;
                            info!("State: LOADING → RUNNING ({} mode)", self.state.mode);
                            self.status.update("Detection model ready, describing automatically.");
                            // First cycle fires immediately, then the fixed period
                            scheduler = Some(new_scheduler(self.timing.period, true));
                        }
                        Ok(Err(e)) => {
                            warn!("{e}");
                            self.status.update(&format!("Detection model failed to load: {e}"));
                        }
                        Err(_) => {
                            warn!("Model loader dropped without a result");
                            self.status.update("Detection model failed to load.");
                        }
                    }
                }

                _ = async { scheduler.as_mut().unwrap().tick().await }, if scheduler.is_some() => {
                    if inflight.is_some() {
                        debug!("Previous cycle still in flight, skipping tick");
                    } else {
                        inflight = Some(self.dispatch_cycle());
                    }
                }

                outcome = async { inflight.as_mut().unwrap().await }, if inflight.is_some() => {
                    inflight = None;
                    match outcome {
                        Ok(outcome) => self.apply_outcome(outcome),
                        Err(e) => warn!("Cycle task failed: {e}"),
                    }
                }

                changed = voices_rx.changed() => {
                    if changed.is_ok() {
                        let count = voices_rx.borrow_and_update().len();
                        self.status.update(&format!("Voice catalog updated ({count} voices)"));
                    }
                }
            }
        }

        info!("Perception loop stopped");
    }

    /// Returns false when the loop should stop.
    fn handle_command(
        &mut self,
        cmd: Command,
        scheduler: &mut Option<Interval>,
        inflight: &mut Option<JoinHandle<CycleOutcome>>,
    ) -> bool {
        match cmd {
            Command::SetMode(mode) => {
                if self.state.mode != mode {
                    // Takes effect on the next cycle; an in-flight cycle
                    // finishes in the mode it started with.
                    self.state.mode = mode;
                    info!("Mode switched to {mode}");
                }
                self.status.update(&format!("{mode} mode"));
            }
            Command::Pause => {
                if !self.state.running {
                    self.status.update("Already paused.");
                } else {
                    self.state.running = false;
                    *scheduler = None;
                    // An in-flight cycle finishes and its result is shown
                    info!("State: RUNNING → IDLE");
                    self.status.update("Paused.");
                }
            }
            Command::Resume => {
                if self.state.running {
                    self.status.update("Already running.");
                } else if self.detector.is_none() {
                    self.status.update("Detection model is not available.");
                } else {
                    self.state.running = true;
                    // Replaces any previous interval, never stacks; next
                    // cycle lands one full period out
                    *scheduler = Some(new_scheduler(self.timing.period, false));
                    info!("State: IDLE → RUNNING");
                    self.status.update("Resumed.");
                }
            }
            Command::DescribeNow => {
                if self.detector.is_none() {
                    self.status.update("Detection model is still loading.");
                } else if inflight.is_some() {
                    self.status.update("Still working on the previous description.");
                } else {
                    debug!("Manual cycle requested");
                    *inflight = Some(self.dispatch_cycle());
                }
            }
            Command::SetVoice(name) => {
                let known = self.sink.voices().iter().any(|v| v.name == name);
                self.settings.lock().unwrap().voice = name.clone();
                if known {
                    self.status.update(&format!("Voice set to {name}."));
                } else {
                    self.status
                        .update(&format!("Voice {name} not available, engine default will be used."));
                }
            }
            Command::SetRate(rate) => {
                let rate = rate.clamp(0.5, 2.0);
                self.settings.lock().unwrap().rate = rate;
                self.status.update(&format!("Speech rate set to {rate:.1}x."));
            }
            Command::RefreshVoices => {
                if let Err(e) = self.sink.refresh_voices() {
                    self.status.update(&format!("Voice refresh failed: {e}"));
                }
            }
            Command::Quit => {
                info!("Quit requested");
                return false;
            }
        }
        true
    }

    /// Start one cycle in the current mode. The cycle captures its mode and
    /// adapters; later state changes don't affect it.
    fn dispatch_cycle(&self) -> JoinHandle<CycleOutcome> {
        let mode = self.state.mode;
        let camera = Arc::clone(&self.camera);
        let detector = self.detector.clone();
        let ocr = Arc::clone(&self.ocr);
        let overlay = Arc::clone(&self.overlay);
        let summarizer = self.summarizer.clone();
        tokio::spawn(run_cycle(mode, camera, detector, ocr, overlay, summarizer))
    }

    /// Apply a finished cycle: status text always, narration through the
    /// gate with the fixed deferral.
    fn apply_outcome(&mut self, outcome: CycleOutcome) {
        debug!("{} cycle complete", outcome.mode);
        self.status.update(&outcome.status);

        let Some(speech) = outcome.speech else {
            return;
        };
        if !self.gate.should_speak(&speech) {
            debug!("Narration suppressed (unchanged): {speech}");
            return;
        }
        self.gate.record(&speech);

        let sink = Arc::clone(&self.sink);
        let settings = Arc::clone(&self.settings);
        let defer = self.timing.defer;
        tokio::spawn(async move {
            tokio::time::sleep(defer).await;
            // Voice and rate are read here, at speak time
            let params = settings.lock().unwrap().clone();
            if let Err(e) = sink.speak(speech.trim(), &params).await {
                warn!("Narration failed: {e}");
            }
        });
    }
}

fn new_scheduler(period: Duration, immediate_first: bool) -> Interval {
    let mut scheduler = if immediate_first {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    scheduler.set_missed_tick_behavior(MissedTickBehavior::Delay);
    scheduler
}

/// One execution of the per-mode pipeline. Adapter failures never escape:
/// they become a status line and a spoken apology.
async fn run_cycle(
    mode: Mode,
    camera: SharedCamera,
    detector: Option<Arc<dyn DetectionAdapter>>,
    ocr: Arc<dyn TextRecognitionAdapter>,
    overlay: Arc<OverlayRenderer>,
    summarizer: Summarizer,
) -> CycleOutcome {
    let frame = match capture_frame(camera).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{e}");
            return CycleOutcome {
                mode,
                status: format!("Camera error: {e}"),
                speech: Some("Sorry, I can't see anything right now.".into()),
            };
        }
    };

    match mode {
        Mode::Scene => {
            let Some(detector) = detector else {
                return CycleOutcome {
                    mode,
                    status: "Detection model is still loading.".into(),
                    speech: None,
                };
            };
            match detector.detect(&frame).await {
                Ok(detections) => {
                    // Overlay renders before any narration decision
                    overlay.render(&frame, &detections);
                    let summary = summarizer.summarize(&detections);
                    CycleOutcome {
                        mode,
                        status: summary.display,
                        speech: Some(summary.speech),
                    }
                }
                Err(e) => {
                    warn!("{e}");
                    CycleOutcome {
                        mode,
                        status: "Scene description failed.".into(),
                        speech: Some("Sorry, something went wrong describing the scene.".into()),
                    }
                }
            }
        }
        Mode::Text => match ocr.recognize(&frame).await {
            Ok(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    CycleOutcome {
                        mode,
                        status: "No readable text found.".into(),
                        speech: Some("Sorry, I could not find any text to read.".into()),
                    }
                } else {
                    CycleOutcome {
                        mode,
                        status: format!("Read: {text}"),
                        // OCR text is spoken verbatim, never summarized
                        speech: Some(text),
                    }
                }
            }
            Err(e) => {
                warn!("{e}");
                CycleOutcome {
                    mode,
                    status: "Text recognition failed.".into(),
                    speech: Some("Sorry, I could not read the text.".into()),
                }
            }
        },
    }
}

async fn capture_frame(camera: SharedCamera) -> Result<Frame, CameraError> {
    tokio::task::spawn_blocking(move || camera.lock().unwrap().current_frame())
        .await
        .map_err(|e| CameraError::DeviceUnavailable(format!("capture task: {e}")))?
}
