//! Speech output via a native Kokoro ONNX engine.
//!
//! Pipeline per utterance: text → phonemes (misaki-rs G2P) → token IDs →
//! ONNX inference → f32 audio queued on a persistent rodio sink. Queued
//! audio is never pre-empted: utterances play in the order they were
//! accepted, and a new speak call waits behind whatever is already queued.
//!
//! The engine also owns the voice catalog. Hosts subscribe to catalog
//! changes through a watch channel and a selected voice that disappears
//! falls back to the engine default at speak time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::NarrationConfig;
use crate::error::NarrationError;
use crate::narration::SpeechParams;

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension

/// Snapshot entry of the narration engine's voice catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub name: String,
    pub language_tag: String,
    pub is_default: bool,
}

/// Speech output boundary.
#[async_trait]
pub trait NarrationSink: Send + Sync {
    /// Speak text. Returns once the utterance (and anything queued ahead of
    /// it) has finished playing. Never interrupts queued content.
    async fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), NarrationError>;

    /// Current voice catalog snapshot.
    fn voices(&self) -> Vec<VoiceProfile>;

    /// Subscribe to catalog changes.
    fn subscribe_voices(&self) -> watch::Receiver<Vec<VoiceProfile>>;

    /// Re-read the catalog and notify subscribers.
    fn refresh_voices(&self) -> Result<(), NarrationError>;
}

/// Native Kokoro TTS sink.
pub struct KokoroSink {
    // ONNX model (Mutex because ort 2.0 Session::run needs &mut)
    session: Mutex<ort::session::Session>,

    // Phonemizer (misaki-rs G2P)
    phonemizer: misaki_rs::G2P,

    // Tokenizer vocabulary: char → token ID
    vocab: HashMap<char, i64>,

    // Voice styles by name, reloadable
    voices: Mutex<HashMap<String, Array2<f32>>>,
    voices_path: PathBuf,
    default_voice: String,

    catalog_tx: watch::Sender<Vec<VoiceProfile>>,

    // Playback queue. The sink is persistent: appends play FIFO and nothing
    // already queued is ever stopped.
    queue: Mutex<Sink>,
    _stream: OutputStream,
}

impl KokoroSink {
    /// Load the ONNX model, tokenizer, voices, phonemizer, and audio output.
    /// Blocking; called once at startup before the loop starts.
    pub fn load(config: &NarrationConfig) -> Result<Self, NarrationError> {
        let t0 = Instant::now();
        let base_dir = std::env::current_dir().unwrap_or_default();

        let model_path = path_or(&config.model_path, base_dir.join("kokoro-v1.0.onnx"));
        let voices_path = path_or(&config.voices_path, base_dir.join("voices-v1.0.bin"));
        let tokenizer_path = path_or(&config.tokenizer_path, base_dir.join("tokenizer.json"));

        info!("Loading tokenizer from {}", tokenizer_path.display());
        let vocab = load_tokenizer(&tokenizer_path)?;

        info!("Loading voices from {}", voices_path.display());
        let voices = load_voices(&voices_path)?;
        info!("Loaded {} voices", voices.len());

        info!("Loading speech model from {}", model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| NarrationError::Unsupported(format!("session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| NarrationError::Unsupported(format!("optimization level: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| NarrationError::Unsupported(format!("thread count: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| NarrationError::Unsupported(format!("{}: {e}", model_path.display())))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| NarrationError::Unsupported(format!("audio output: {e}")))?;
        let queue = Sink::connect_new(stream.mixer());

        let catalog = build_catalog(&voices, &config.voice);
        let (catalog_tx, _) = watch::channel(catalog);

        info!("Speech engine loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            voices: Mutex::new(voices),
            voices_path,
            default_voice: config.voice.clone(),
            catalog_tx,
            queue: Mutex::new(queue),
            _stream: stream,
        })
    }

    /// Generate audio samples for one utterance.
    fn synthesize(&self, text: &str, style: &Array2<f32>, rate: f32) -> Result<Vec<f32>, NarrationError> {
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(text)
            .map_err(|e| NarrationError::Synthesis(format!("phonemization: {e}")))?;

        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0); // Start padding
        for ch in phonemes.chars() {
            if let Some(&id) = self.vocab.get(&ch) {
                token_ids.push(id);
            }
            // Unknown characters are skipped
        }
        token_ids.push(0); // End padding

        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        // Style vectors are indexed by token count
        let style_idx = n_tokens.saturating_sub(2).min(style.nrows() - 1);
        let style_vec: Vec<f32> = style.row(style_idx).to_vec();

        let tokens_array = ndarray::Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| NarrationError::Synthesis(format!("tokens tensor: {e}")))?;
        let tokens_tensor = Tensor::from_array(tokens_array)
            .map_err(|e| NarrationError::Synthesis(format!("tokens tensor: {e}")))?;

        let style_array = ndarray::Array2::from_shape_vec((1, 256), style_vec)
            .map_err(|e| NarrationError::Synthesis(format!("style tensor: {e}")))?;
        let style_tensor = Tensor::from_array(style_array)
            .map_err(|e| NarrationError::Synthesis(format!("style tensor: {e}")))?;

        let speed_array = ndarray::Array1::from_vec(vec![rate]);
        let speed_tensor = Tensor::from_array(speed_array)
            .map_err(|e| NarrationError::Synthesis(format!("speed tensor: {e}")))?;

        let mut session = self.session.lock().unwrap();
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| NarrationError::Synthesis(e.to_string()))?;

        let first_output = outputs
            .iter()
            .next()
            .ok_or_else(|| NarrationError::Synthesis("no output tensor".into()))?;

        let (_shape, audio_slice) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| NarrationError::Synthesis(format!("extract audio: {e}")))?;

        let samples: Vec<f32> = audio_slice.to_vec();
        debug!(
            "Synthesized {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }
}

#[async_trait]
impl NarrationSink for KokoroSink {
    async fn speak(&self, text: &str, params: &SpeechParams) -> Result<(), NarrationError> {
        // Resolve the voice at speak time; a vanished name falls back to the
        // engine default silently.
        let style = {
            let voices = self.voices.lock().unwrap();
            let name = resolve_voice(&params.voice, &voices, &self.default_voice);
            match voices.get(&name) {
                Some(style) => style.clone(),
                None => {
                    return Err(NarrationError::Synthesis(format!(
                        "no usable voice (requested {}, default {})",
                        params.voice, self.default_voice
                    )))
                }
            }
        };

        // Synthesis blocks the task briefly; acceptable since narration is
        // already deferred off the perception cycle.
        let samples = self.synthesize(text, &style, params.rate)?;
        if samples.is_empty() {
            return Ok(());
        }

        {
            let queue = self.queue.lock().unwrap();
            queue.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
        }

        // Wait for the queue to drain without holding the lock.
        loop {
            let empty = self.queue.lock().unwrap().empty();
            if empty {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    fn voices(&self) -> Vec<VoiceProfile> {
        build_catalog(&self.voices.lock().unwrap(), &self.default_voice)
    }

    fn subscribe_voices(&self) -> watch::Receiver<Vec<VoiceProfile>> {
        self.catalog_tx.subscribe()
    }

    fn refresh_voices(&self) -> Result<(), NarrationError> {
        let reloaded = load_voices(&self.voices_path)?;
        let catalog = build_catalog(&reloaded, &self.default_voice);
        *self.voices.lock().unwrap() = reloaded;
        if self.catalog_tx.send(catalog).is_err() {
            debug!("No voice catalog subscribers");
        }
        Ok(())
    }
}

/// Silent sink used when the speech engine is unavailable or disabled. The
/// loop keeps updating status text; speak calls succeed without audio.
pub struct NullSink {
    catalog_tx: watch::Sender<Vec<VoiceProfile>>,
}

impl NullSink {
    pub fn new() -> Self {
        let (catalog_tx, _) = watch::channel(Vec::new());
        Self { catalog_tx }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NarrationSink for NullSink {
    async fn speak(&self, text: &str, _params: &SpeechParams) -> Result<(), NarrationError> {
        debug!("Silent narration: {text}");
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

// --- Helper functions ---

fn path_or(configured: &str, fallback: PathBuf) -> PathBuf {
    if configured.is_empty() {
        fallback
    } else {
        PathBuf::from(configured)
    }
}

/// Pick the voice to use: the requested name if it exists, else the default,
/// else the first voice in the catalog.
fn resolve_voice(
    requested: &str,
    voices: &HashMap<String, Array2<f32>>,
    default: &str,
) -> String {
    if voices.contains_key(requested) {
        return requested.to_string();
    }
    if !requested.is_empty() {
        warn!("Voice '{requested}' not available, using '{default}'");
    }
    if voices.contains_key(default) {
        return default.to_string();
    }
    let mut names: Vec<&String> = voices.keys().collect();
    names.sort();
    names
        .first()
        .map(|n| n.to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Kokoro voice names encode accent in their first letter.
fn language_tag(name: &str) -> &'static str {
    match name.as_bytes().first() {
        Some(b'a') => "en-US",
        Some(b'b') => "en-GB",
        _ => "und",
    }
}

fn build_catalog(voices: &HashMap<String, Array2<f32>>, default: &str) -> Vec<VoiceProfile> {
    let mut catalog: Vec<VoiceProfile> = voices
        .keys()
        .map(|name| VoiceProfile {
            name: name.clone(),
            language_tag: language_tag(name).to_string(),
            is_default: name == default,
        })
        .collect();
    catalog.sort_by(|a, b| a.name.cmp(&b.name));
    catalog
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, NarrationError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| NarrationError::Unsupported(format!("read tokenizer: {e}")))?;

    let data: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| NarrationError::Unsupported(format!("parse tokenizer: {e}")))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or_else(|| NarrationError::Unsupported("missing model.vocab in tokenizer".into()))?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id
            .as_i64()
            .ok_or_else(|| NarrationError::Unsupported("token ID is not an integer".into()))?;
        // Each token is a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }

    Ok(map)
}

/// Load all voice styles from an NPZ file. Shape (510, 1, 256) per voice,
/// squeezed to (510, 256).
fn load_voices(path: &Path) -> Result<HashMap<String, Array2<f32>>, NarrationError> {
    let file = fs::File::open(path)
        .map_err(|e| NarrationError::Unsupported(format!("open voices file: {e}")))?;

    let mut npz = NpzReader::new(file)
        .map_err(|e| NarrationError::Unsupported(format!("read voices file: {e}")))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| NarrationError::Unsupported(format!("list voices: {e}")))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in &names {
        let npy_name = format!("{name}.npy");
        let arr: Array3<f32> = npz
            .by_name(&npy_name)
            .map_err(|e| NarrationError::Unsupported(format!("read voice '{name}': {e}")))?;

        let dim0 = arr.shape()[0];
        let dim2 = arr.shape()[2];
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| NarrationError::Unsupported(format!("reshape voice '{name}': {e}")))?;

        voices.insert(name.clone(), styles);
    }

    Ok(voices)
}
